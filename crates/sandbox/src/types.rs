/// A command to run inside an instance.
///
/// The command is an argument vector; it is never joined into a shell
/// string by the runtime.
#[derive(Debug, Clone, Copy)]
pub struct ExecRequest<'a> {
    pub argv: &'a [&'a str],
    pub workdir: Option<&'a str>,
    pub env: &'a [(&'a str, &'a str)],
    /// Bytes written to the process's stdin before it is closed.
    pub stdin: Option<&'a [u8]>,
}

impl<'a> ExecRequest<'a> {
    pub fn new(argv: &'a [&'a str]) -> Self {
        Self {
            argv,
            workdir: None,
            env: &[],
            stdin: None,
        }
    }

    pub fn workdir(mut self, dir: &'a str) -> Self {
        self.workdir = Some(dir);
        self
    }

    pub fn env(mut self, env: &'a [(&'a str, &'a str)]) -> Self {
        self.env = env;
        self
    }

    pub fn stdin(mut self, bytes: &'a [u8]) -> Self {
        self.stdin = Some(bytes);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

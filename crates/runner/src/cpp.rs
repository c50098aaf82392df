use std::path::Path;
use std::time::Duration;

use sandbox::{ExecRequest, ExecResult};
use sandbox_pool::ContainerPool;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{RunnerError, RunnerResult};
use crate::python::TIMEOUT_MESSAGE;
use crate::types::{ErrorKind, ExecutionResult};

const BUILD_DIR: &str = "/tmp/build";
const SOURCE_DEST: &str = "/tmp/build/code.cpp";
const INPUT_DEST: &str = "/tmp/build/input.txt";

/// Runs the compiled program under `timeout`, fed from `input.txt` when it
/// was staged. `$1` is the time limit in seconds.
const RUN_SCRIPT: &str = r#"if [ -f input.txt ]; then exec timeout -k 1s "$1" ./program < input.txt; else exec timeout -k 1s "$1" ./program; fi"#;

/// Exit status `timeout` reports when the limit expired. The program can
/// exit with it too, so the run time is checked as well.
const TIMEOUT_EXIT: i32 = 124;

#[derive(Debug, Clone)]
pub struct CppSettings {
    pub compiler_flags: Vec<String>,
    /// Bound on compile and run together, enforced on the host.
    pub timeout: Duration,
    /// Bound on the program alone, enforced inside the instance.
    pub program_timeout: Duration,
}

/// Compiles and runs C++ submissions in instances leased from a pool.
#[derive(Clone)]
pub struct CppRunner {
    pool: ContainerPool,
    settings: CppSettings,
}

impl CppRunner {
    pub fn new(pool: ContainerPool, settings: CppSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &ContainerPool {
        &self.pool
    }

    /// Compile `code` and run it with `input` on stdin.
    ///
    /// Compiler diagnostics, timeouts and program failures come back as
    /// data. Sandbox failures are errors.
    pub async fn run(&self, code: &str, input: Option<&str>) -> RunnerResult<ExecutionResult> {
        let scratch = tempfile::Builder::new().prefix("cpp-").tempdir()?;
        let source = scratch.path().join("code.cpp");
        tokio::fs::write(&source, code).await?;

        let input_path = match input.filter(|text| !text.is_empty()) {
            Some(text) => {
                let path = scratch.path().join("input.txt");
                tokio::fs::write(&path, text).await?;
                Some(path)
            }
            None => None,
        };

        let lease = self.pool.lease().await?;
        debug!(id = lease.id(), has_input = input_path.is_some(), "running c++ submission");

        let outcome = tokio::time::timeout(
            self.settings.timeout,
            self.compile_and_run(lease.id(), &source, input_path.as_deref()),
        )
        .await;
        let id = lease.id().to_string();
        lease.release().await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                info!(
                    id = %id,
                    timeout_ms = self.settings.timeout.as_millis() as u64,
                    "c++ execution timed out"
                );
                Ok(ExecutionResult::failed(TIMEOUT_MESSAGE, ErrorKind::Timeout))
            }
        }
    }

    async fn compile_and_run(
        &self,
        id: &str,
        source: &Path,
        input: Option<&Path>,
    ) -> RunnerResult<ExecutionResult> {
        let runtime = self.pool.runtime();

        let prepared = runtime
            .exec(id, &ExecRequest::new(&["mkdir", "-p", BUILD_DIR]))
            .await?;
        if !prepared.success() {
            return Err(RunnerError::Fault(format!(
                "create {BUILD_DIR}: {}",
                prepared.stderr.trim()
            )));
        }
        runtime.copy_in(id, source, SOURCE_DEST).await?;
        if let Some(input) = input {
            runtime.copy_in(id, input, INPUT_DEST).await?;
        }

        let mut compile: Vec<&str> = vec!["g++"];
        compile.extend(self.settings.compiler_flags.iter().map(String::as_str));
        compile.extend(["code.cpp", "-o", "program"]);
        let compiled = runtime
            .exec(id, &ExecRequest::new(&compile).workdir(BUILD_DIR))
            .await?;
        if !compiled.success() || !compiled.stderr.trim().is_empty() {
            debug!(id = %id, exit_code = compiled.exit_code, "compiler reported diagnostics");
            return Ok(ExecutionResult::failed(
                compile_output(&compiled),
                ErrorKind::CompileError,
            ));
        }

        let limit = format!("{:.3}", self.settings.program_timeout.as_secs_f64());
        let run = ["sh", "-c", RUN_SCRIPT, "run", limit.as_str()];
        let started = Instant::now();
        let ran = runtime
            .exec(id, &ExecRequest::new(&run).workdir(BUILD_DIR))
            .await?;

        // A program may exit 124 on its own; only a run that lasted the
        // whole limit was cut off by `timeout`.
        let cut_off = started.elapsed() >= self.settings.program_timeout;
        if ran.exit_code == TIMEOUT_EXIT && cut_off {
            info!(id = %id, limit = %limit, "c++ program timed out");
            return Ok(ExecutionResult::failed(TIMEOUT_MESSAGE, ErrorKind::Timeout));
        }
        Ok(ExecutionResult::output(program_output(&ran)))
    }
}

fn compile_output(exec: &ExecResult) -> String {
    let stderr = exec.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = exec.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("Compilation failed with status {}", exec.exit_code)
}

/// Stdout, falling back to stderr, then to the exit status on failure.
fn program_output(exec: &ExecResult) -> String {
    let stdout = exec.stdout.trim_end();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    let stderr = exec.stderr.trim_end();
    if !stderr.is_empty() || exec.success() {
        return stderr.to_string();
    }
    format!("Program exited with status {}", exec.exit_code)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sandbox::SandboxError;
    use sandbox::testing::{ExecCall, FakeRuntime};

    use super::*;
    use crate::testutil::test_pool;

    const SUM: &str = "#include <iostream>\nint main(){int a,b;std::cin>>a>>b;std::cout<<a+b<<std::endl;}";

    fn runner(runtime: &Arc<FakeRuntime>) -> CppRunner {
        runner_with_flags(runtime, Vec::new())
    }

    fn runner_with_flags(runtime: &Arc<FakeRuntime>, compiler_flags: Vec<String>) -> CppRunner {
        CppRunner::new(
            test_pool(runtime, "cpp"),
            CppSettings {
                compiler_flags,
                timeout: Duration::from_secs(10),
                program_timeout: Duration::from_secs(5),
            },
        )
    }

    /// Runner whose program limit is short enough that a delayed fake exec
    /// outlasts it while compile and run stay inside the outer bound.
    fn runner_with_short_limit(runtime: &Arc<FakeRuntime>) -> CppRunner {
        CppRunner::new(
            test_pool(runtime, "cpp"),
            CppSettings {
                compiler_flags: Vec::new(),
                timeout: Duration::from_secs(10),
                program_timeout: Duration::from_secs(1),
            },
        )
    }

    fn exit(code: i32, stdout: &str, stderr: &str) -> ExecResult {
        ExecResult {
            exit_code: code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    fn is_run(call: &ExecCall) -> bool {
        call.argv.iter().any(|a| a == RUN_SCRIPT)
    }

    /// Answer `g++` with `compile` and the run script with `run`.
    fn script(runtime: &FakeRuntime, compile: ExecResult, run: ExecResult) {
        runtime.on_exec(move |call| {
            if call.program() == "g++" {
                Ok(compile.clone())
            } else if is_run(call) {
                Ok(run.clone())
            } else {
                Ok(exit(0, "", ""))
            }
        });
    }

    #[tokio::test]
    async fn sum_round_trip() {
        let runtime = Arc::new(FakeRuntime::new());
        script(&runtime, exit(0, "", ""), exit(0, "5\n", ""));
        let runner = runner(&runtime);

        let result = runner.run(SUM, Some("2 3")).await.unwrap();
        assert_eq!(result, ExecutionResult::output("5"));

        let copies = runtime.copies_in();
        assert_eq!(copies.len(), 2);
        assert!(copies.iter().any(|c| c.dest == SOURCE_DEST && c.contents == SUM.as_bytes()));
        assert!(copies.iter().any(|c| c.dest == INPUT_DEST && c.contents == b"2 3"));

        let execs = runtime.execs();
        let compile = execs.iter().find(|c| c.program() == "g++").unwrap();
        assert_eq!(compile.argv, vec!["g++", "code.cpp", "-o", "program"]);
        assert_eq!(compile.workdir.as_deref(), Some(BUILD_DIR));
        let run = execs.iter().find(|c| is_run(c)).unwrap();
        assert_eq!(run.argv, vec!["sh", "-c", RUN_SCRIPT, "run", "5.000"]);
        assert_eq!(run.workdir.as_deref(), Some(BUILD_DIR));

        assert_eq!(runner.pool().stats().await.busy, 0);
    }

    #[tokio::test]
    async fn empty_input_is_not_staged() {
        let runtime = Arc::new(FakeRuntime::new());
        script(&runtime, exit(0, "", ""), exit(0, "hi\n", ""));
        let runner = runner(&runtime);

        runner.run("int main(){}", Some("")).await.unwrap();
        runner.run("int main(){}", None).await.unwrap();
        assert!(runtime.copies_in().iter().all(|c| c.dest == SOURCE_DEST));
    }

    #[tokio::test]
    async fn compiler_flags_precede_source() {
        let runtime = Arc::new(FakeRuntime::new());
        let runner = runner_with_flags(&runtime, vec!["-O2".into(), "-std=c++17".into()]);
        runner.run("int main(){}", None).await.unwrap();

        let compile = runtime
            .execs()
            .into_iter()
            .find(|c| c.program() == "g++")
            .unwrap();
        assert_eq!(
            compile.argv,
            vec!["g++", "-O2", "-std=c++17", "code.cpp", "-o", "program"]
        );
    }

    #[tokio::test]
    async fn compile_error_never_runs_binary() {
        let runtime = Arc::new(FakeRuntime::new());
        script(
            &runtime,
            exit(1, "", "code.cpp:1:1: error: expected unqualified-id\n"),
            exit(0, "should not run", ""),
        );
        let runner = runner(&runtime);

        let result = runner.run("int main( {", None).await.unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::CompileError));
        assert_eq!(result.output, "code.cpp:1:1: error: expected unqualified-id");
        assert!(!runtime.execs().iter().any(is_run));
        assert_eq!(runner.pool().stats().await.busy, 0);
    }

    #[tokio::test]
    async fn warnings_count_as_compile_error() {
        let runtime = Arc::new(FakeRuntime::new());
        script(
            &runtime,
            exit(0, "", "code.cpp:2:5: warning: unused variable 'x'\n"),
            exit(0, "ok", ""),
        );
        let runner = runner(&runtime);

        let result = runner.run("int main(){int x;}", None).await.unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::CompileError));
        assert!(!runtime.execs().iter().any(is_run));
    }

    #[tokio::test(start_paused = true)]
    async fn program_timeout_is_reported() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_delay(Duration::from_secs(2));
        script(&runtime, exit(0, "", ""), exit(TIMEOUT_EXIT, "", ""));
        let runner = runner_with_short_limit(&runtime);

        let result = runner.run("int main(){for(;;);}", None).await.unwrap();
        assert_eq!(result, ExecutionResult::failed(TIMEOUT_MESSAGE, ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn program_exiting_124_quickly_is_not_a_timeout() {
        let runtime = Arc::new(FakeRuntime::new());
        script(&runtime, exit(0, "", ""), exit(TIMEOUT_EXIT, "", ""));
        let runner = runner(&runtime);

        let result = runner.run("int main(){return 124;}", None).await.unwrap();
        assert_eq!(result.output, "Program exited with status 124");
        assert!(result.error_kind.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn outer_timeout_is_reported_and_releases() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_delay(Duration::from_secs(60));
        let runner = runner(&runtime);

        let result = runner.run("int main(){}", None).await.unwrap();
        assert_eq!(result, ExecutionResult::failed(TIMEOUT_MESSAGE, ErrorKind::Timeout));
        let stats = runner.pool().stats().await;
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.available, 1);
    }

    #[tokio::test]
    async fn crashing_program_reports_status() {
        let runtime = Arc::new(FakeRuntime::new());
        script(&runtime, exit(0, "", ""), exit(139, "", ""));
        let runner = runner(&runtime);

        let result = runner.run("int main(){*(int*)0=1;}", None).await.unwrap();
        assert_eq!(result.output, "Program exited with status 139");
        assert!(result.error_kind.is_none());
    }

    #[tokio::test]
    async fn failing_program_prefers_stdout() {
        let runtime = Arc::new(FakeRuntime::new());
        script(&runtime, exit(0, "", ""), exit(3, "partial\n", "oops\n"));
        let runner = runner(&runtime);

        let result = runner.run("int main(){return 3;}", None).await.unwrap();
        assert_eq!(result.output, "partial");
    }

    #[tokio::test]
    async fn sandbox_failure_is_an_error_and_releases() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.on_exec(|call| {
            if call.program() == "g++" {
                Err(SandboxError::ExecFailed("daemon went away".into()))
            } else {
                Ok(exit(0, "", ""))
            }
        });
        let runner = runner(&runtime);

        let err = runner.run("int main(){}", None).await.unwrap_err();
        assert!(matches!(err, RunnerError::SandboxUnavailable(_)), "{err}");
        assert_eq!(runner.pool().stats().await.busy, 0);
    }

    #[test]
    fn program_output_fallbacks() {
        assert_eq!(program_output(&exit(0, "", "to stderr\n")), "to stderr");
        assert_eq!(program_output(&exit(0, "", "")), "");
        assert_eq!(program_output(&exit(1, "", "")), "Program exited with status 1");
        assert_eq!(compile_output(&exit(1, "", "")), "Compilation failed with status 1");
    }
}

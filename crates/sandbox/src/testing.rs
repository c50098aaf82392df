//! In-memory [`SandboxRuntime`] for tests.
//!
//! Instances are plain ids; `exec` answers from a scripted handler and
//! records every call so tests can assert on exactly which commands ran.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{InstanceSpec, Label};
use crate::error::{Result, SandboxError};
use crate::runtime::SandboxRuntime;
use crate::types::{ExecRequest, ExecResult};

/// One recorded `exec` call, with owned copies of the request fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub id: String,
    pub argv: Vec<String>,
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
}

impl ExecCall {
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn stdin_text(&self) -> String {
        self.stdin
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }
}

/// One recorded `copy_in` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyIn {
    pub id: String,
    pub dest: String,
    pub contents: Vec<u8>,
}

type ExecHandler = dyn Fn(&ExecCall) -> Result<ExecResult> + Send + Sync;

#[derive(Default)]
struct State {
    next_id: usize,
    running: HashSet<String>,
    labels: HashMap<String, Label>,
    started: usize,
    removed: Vec<String>,
    fail_starts: usize,
    execs: Vec<ExecCall>,
    copies_in: Vec<CopyIn>,
    /// Files materialized by `copy_out`, keyed by in-instance source path.
    outputs: HashMap<String, Vec<(String, Vec<u8>)>>,
    start_delay: Option<Duration>,
    exec_delay: Option<Duration>,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
    handler: Mutex<Option<Arc<ExecHandler>>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer every `exec` with `handler` instead of an empty success.
    pub fn on_exec<F>(&self, handler: F)
    where
        F: Fn(&ExecCall) -> Result<ExecResult> + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Make the next `n` calls to `start` fail.
    pub fn fail_next_starts(&self, n: usize) {
        self.state().fail_starts = n;
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.state().start_delay = Some(delay);
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        self.state().exec_delay = Some(delay);
    }

    /// Files that `copy_out(source, ..)` will produce.
    pub fn set_output_files(&self, source: &str, files: Vec<(String, Vec<u8>)>) {
        self.state().outputs.insert(source.to_string(), files);
    }

    /// Simulate an instance dying on its own.
    pub fn kill(&self, id: &str) {
        self.state().running.remove(id);
    }

    /// Register an instance that was not started through this runtime
    /// (e.g. left over by a previous process).
    pub fn seed_instance(&self, label: Label) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("stale-{}", state.next_id);
        state.running.insert(id.clone());
        state.labels.insert(id.clone(), label);
        id
    }

    pub fn started(&self) -> usize {
        self.state().started
    }

    pub fn running(&self) -> usize {
        self.state().running.len()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        self.state().execs.clone()
    }

    pub fn copies_in(&self) -> Vec<CopyIn> {
        self.state().copies_in.clone()
    }
}

fn success() -> ExecResult {
    ExecResult {
        exit_code: 0,
        stdout: String::new(),
        stderr: String::new(),
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self, spec: &InstanceSpec) -> Result<String> {
        let delay = self.state().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.fail_starts > 0 {
            state.fail_starts -= 1;
            return Err(SandboxError::ImageUnavailable(spec.image.clone()));
        }
        state.next_id += 1;
        state.started += 1;
        let id = format!("fake-{}", state.next_id);
        state.running.insert(id.clone());
        state.labels.insert(id.clone(), spec.label.clone());
        Ok(id)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.running.remove(id);
        state.labels.remove(id);
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        Ok(self.state().running.contains(id))
    }

    async fn list(&self, label: &Label) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .state()
            .labels
            .iter()
            .filter(|(_, l)| *l == label)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn exec(&self, id: &str, request: &ExecRequest<'_>) -> Result<ExecResult> {
        let call = ExecCall {
            id: id.to_string(),
            argv: request.argv.iter().map(|s| s.to_string()).collect(),
            workdir: request.workdir.map(String::from),
            env: request
                .env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            stdin: request.stdin.map(<[u8]>::to_vec),
        };
        let delay = {
            let mut state = self.state();
            if !state.running.contains(id) {
                return Err(SandboxError::NotFound(format!("instance {id}")));
            }
            state.execs.push(call.clone());
            state.exec_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(&call),
            None => Ok(success()),
        }
    }

    async fn copy_in(&self, id: &str, source: &Path, dest: &str) -> Result<()> {
        let contents = std::fs::read(source)?;
        let mut state = self.state();
        if !state.running.contains(id) {
            return Err(SandboxError::NotFound(format!("instance {id}")));
        }
        state.copies_in.push(CopyIn {
            id: id.to_string(),
            dest: dest.to_string(),
            contents,
        });
        Ok(())
    }

    async fn copy_out(&self, id: &str, source: &str, dest_dir: &Path) -> Result<()> {
        let files = {
            let state = self.state();
            if !state.running.contains(id) {
                return Err(SandboxError::NotFound(format!("instance {id}")));
            }
            state
                .outputs
                .get(source)
                .cloned()
                .ok_or_else(|| SandboxError::NotFound(source.to_string()))?
        };
        let base = Path::new(source)
            .file_name()
            .ok_or_else(|| SandboxError::CopyFailed(format!("no base name: {source}")))?;
        let target = dest_dir.join(base);
        std::fs::create_dir_all(&target)?;
        for (name, bytes) in files {
            std::fs::write(target.join(name), bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityPolicy;

    fn spec() -> InstanceSpec {
        InstanceSpec {
            image: "img".into(),
            command: vec!["sleep".into(), "infinity".into()],
            policy: SecurityPolicy::default(),
            label: Label::new("pool", "test"),
        }
    }

    #[tokio::test]
    async fn start_and_remove_track_liveness() {
        let rt = FakeRuntime::new();
        let id = rt.start(&spec()).await.unwrap();
        assert!(rt.is_running(&id).await.unwrap());
        rt.remove(&id).await.unwrap();
        assert!(!rt.is_running(&id).await.unwrap());
        assert_eq!(rt.removed(), vec![id]);
    }

    #[tokio::test]
    async fn fail_next_starts_fails_then_recovers() {
        let rt = FakeRuntime::new();
        rt.fail_next_starts(1);
        assert!(rt.start(&spec()).await.is_err());
        assert!(rt.start(&spec()).await.is_ok());
        assert_eq!(rt.started(), 1);
    }

    #[tokio::test]
    async fn exec_uses_handler_and_records_call() {
        let rt = FakeRuntime::new();
        let id = rt.start(&spec()).await.unwrap();
        rt.on_exec(|call| {
            Ok(ExecResult {
                exit_code: 0,
                stdout: call.stdin_text(),
                stderr: String::new(),
            })
        });
        let out = rt
            .exec(&id, &ExecRequest::new(&["cat"]).stdin(b"hi"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hi");
        assert_eq!(rt.execs()[0].program(), "cat");
    }

    #[tokio::test]
    async fn copy_out_missing_source_is_not_found() {
        let rt = FakeRuntime::new();
        let id = rt.start(&spec()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = rt.copy_out(&id, "/tmp/output", dir.path()).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn copy_out_materializes_files_under_base_name() {
        let rt = FakeRuntime::new();
        let id = rt.start(&spec()).await.unwrap();
        rt.set_output_files("/tmp/output", vec![("a.png".into(), vec![1, 2, 3])]);
        let dir = tempfile::tempdir().unwrap();
        rt.copy_out(&id, "/tmp/output", dir.path()).await.unwrap();
        let bytes = std::fs::read(dir.path().join("output").join("a.png")).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }
}

use std::sync::Arc;

use sandbox::SandboxRuntime;
use sandbox_pool::{ContainerPool, PoolStats};
use serde::Serialize;
use tracing::info;

use crate::config::ServiceConfig;
use crate::cpp::CppRunner;
use crate::error::{RunnerError, RunnerResult};
use crate::python::PythonRunner;
use crate::types::{ExecutionRequest, ExecutionResult, Language};

#[derive(Debug, Serialize)]
pub struct ServiceStats {
    pub python: PoolStats,
    pub cpp: PoolStats,
}

/// Both runners and their pools. Clone is cheap.
#[derive(Clone)]
pub struct Service {
    python: PythonRunner,
    cpp: CppRunner,
}

impl Service {
    pub fn new(python: PythonRunner, cpp: CppRunner) -> Self {
        Self { python, cpp }
    }

    pub fn from_config(config: &ServiceConfig, runtime: Arc<dyn SandboxRuntime>) -> Self {
        let python_pool = ContainerPool::new(config.python_pool(), Arc::clone(&runtime));
        let cpp_pool = ContainerPool::new(config.cpp_pool(), runtime);
        Self {
            python: PythonRunner::new(python_pool, config.python_settings()),
            cpp: CppRunner::new(cpp_pool, config.cpp_settings()),
        }
    }

    /// Pre-warm both pools concurrently.
    pub async fn initialize(&self) {
        tokio::join!(self.python.pool().initialize(), self.cpp.pool().initialize());
        info!("container pools initialized");
    }

    pub async fn stats(&self) -> ServiceStats {
        let (python, cpp) = tokio::join!(self.python.pool().stats(), self.cpp.pool().stats());
        ServiceStats { python, cpp }
    }

    pub async fn cleanup(&self) {
        tokio::join!(self.python.pool().cleanup(), self.cpp.pool().cleanup());
    }

    /// Validate `request` and hand it to the runner for `language`.
    pub async fn execute(
        &self,
        language: Language,
        request: ExecutionRequest,
    ) -> RunnerResult<ExecutionResult> {
        let code = request
            .code
            .filter(|code| !code.trim().is_empty())
            .ok_or_else(|| RunnerError::Validation("No code provided".into()))?;

        match language {
            Language::Python => self.python.run(&code).await,
            Language::Cpp => self.cpp.run(&code, request.input.as_deref()).await,
        }
    }
}

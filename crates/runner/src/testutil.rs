use std::sync::Arc;
use std::time::Duration;

use sandbox::testing::FakeRuntime;
use sandbox_pool::{ContainerPool, PoolConfig};

use crate::cpp::{CppRunner, CppSettings};
use crate::python::{PythonRunner, PythonSettings};
use crate::service::Service;

/// One-instance pool over `runtime` that gives up quickly.
pub(crate) fn test_pool(runtime: &Arc<FakeRuntime>, name: &str) -> ContainerPool {
    ContainerPool::new(
        PoolConfig {
            size: 1,
            acquire_attempts: 3,
            acquire_interval: Duration::from_millis(10),
            ..PoolConfig::new(name, format!("{name}-image"))
        },
        runtime.clone(),
    )
}

/// Service with one-instance pools for both languages.
pub(crate) fn test_service(runtime: &Arc<FakeRuntime>) -> Service {
    Service::new(
        PythonRunner::new(
            test_pool(runtime, "python"),
            PythonSettings {
                interpreter: vec!["python3".into(), "-".into()],
                timeout: Duration::from_secs(6),
            },
        ),
        CppRunner::new(
            test_pool(runtime, "cpp"),
            CppSettings {
                compiler_flags: Vec::new(),
                timeout: Duration::from_secs(10),
                program_timeout: Duration::from_secs(5),
            },
        ),
    )
}

mod config;
mod error;
mod runtime;
mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{InstanceSpec, Label, ResourceLimits, SecurityPolicy};
pub use error::{Result, SandboxError};
pub use runtime::SandboxRuntime;
pub use types::{ExecRequest, ExecResult};

mod command;
mod config;
mod policy;
mod prerequisites;
mod runtime;

pub use command::{CommandError, Privilege};
pub use config::DockerConfig;
pub use runtime::DockerRuntime;

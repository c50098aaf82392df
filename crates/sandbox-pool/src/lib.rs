//! Warm pool of long-lived sandbox instances.
//!
//! A [`ContainerPool`] keeps `size` instances of one image running so that
//! executions skip the cold-start cost. Callers bracket their work with
//! [`ContainerPool::acquire`] / [`ContainerPool::release`], or hold a
//! [`Lease`] which releases itself.

mod config;
mod error;
mod lease;
mod pool;

pub use config::{POOL_LABEL_KEY, PoolConfig};
pub use error::{PoolError, Result};
pub use lease::Lease;
pub use pool::{ContainerPool, InstanceState, PoolInstance, PoolStats};

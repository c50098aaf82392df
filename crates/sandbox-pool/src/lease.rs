use tracing::warn;

use crate::pool::ContainerPool;

/// An acquired instance that goes back to its pool when released.
///
/// Prefer [`Lease::release`], which waits for the instance to be cleaned.
/// Dropping an unreleased lease hands the release to a background task so
/// an early return or a cancelled request never leaks the instance.
pub struct Lease {
    pool: ContainerPool,
    id: String,
    released: bool,
}

impl Lease {
    pub(crate) fn new(pool: ContainerPool, id: String) -> Self {
        Self {
            pool,
            id,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn release(mut self) {
        self.released = true;
        self.pool.release(&self.id).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let id = std::mem::take(&mut self.id);
        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.release(&id).await });
            }
            Err(_) => {
                warn!(id = %id, "lease dropped outside a runtime, instance stays busy");
            }
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish()
    }
}

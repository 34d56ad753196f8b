use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Allows at most one cycle of a job type at a time.
///
/// Clones share the same permit, so a manual trigger and the timer loop holding
/// clones of one guard exclude each other.
#[derive(Debug, Clone)]
pub struct CycleGuard {
    permit: Arc<Semaphore>,
}

impl CycleGuard {
    pub fn new() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    /// Takes the permit, or `None` if a cycle is already running.
    pub fn try_enter(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permit).try_acquire_owned().ok()
    }

    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }
}

impl Default for CycleGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_is_refused_until_release() {
        let guard = CycleGuard::new();
        let other = guard.clone();

        let permit = guard.try_enter().expect("first entry");
        assert!(other.try_enter().is_none());
        assert!(other.is_busy());

        drop(permit);
        assert!(other.try_enter().is_some());
    }
}

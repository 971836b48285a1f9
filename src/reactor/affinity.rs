//! State pinned to its owning thread.

use std::cell::{RefCell, RefMut};
use std::thread::{self, ThreadId};

/// A `RefCell` that can be shared across threads but only borrowed on the
/// thread that owns it.
///
/// This is how a file handle keeps its registry lock-free: the handle itself
/// is shared (`Arc`) with any caller, while the mutable core is reachable only
/// from the event loop thread. Callers elsewhere get `None` and reschedule
/// their work onto the owner.
pub(crate) struct AffinityCell<T> {
    owner: ThreadId,
    value: RefCell<T>,
}

// SAFETY: the value is only ever borrowed on `owner`, so no two threads can
// observe it at once. Dropping it elsewhere requires `T: Send`.
unsafe impl<T: Send> Sync for AffinityCell<T> {}

impl<T> AffinityCell<T> {
    pub(crate) fn new(owner: ThreadId, value: T) -> Self {
        Self {
            owner,
            value: RefCell::new(value),
        }
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Borrow the value mutably.
    ///
    /// `None` off the owning thread, or on it while a borrow is already live
    /// further up the stack (a completion handler calling back into the
    /// handle).
    pub(crate) fn try_borrow_mut(&self) -> Option<RefMut<'_, T>> {
        if thread::current().id() != self.owner {
            return None;
        }
        self.value.try_borrow_mut().ok()
    }
}

impl<T> std::fmt::Debug for AffinityCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityCell")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn borrow_only_on_owner() {
        let cell = Arc::new(AffinityCell::new(thread::current().id(), 1u32));
        *cell.try_borrow_mut().unwrap() += 1;

        let remote = Arc::clone(&cell);
        let borrowed_elsewhere = thread::spawn(move || remote.try_borrow_mut().is_some())
            .join()
            .unwrap();
        assert!(!borrowed_elsewhere);
        assert_eq!(*cell.try_borrow_mut().unwrap(), 2);
    }

    #[test]
    fn nested_borrow_is_refused() {
        let cell = AffinityCell::new(thread::current().id(), ());
        let outer = cell.try_borrow_mut();
        assert!(outer.is_some());
        assert!(cell.try_borrow_mut().is_none());
    }
}

//! Waker bookkeeping for futures shared by several pollers.

use std::task::Waker;

/// Wakers of every task currently awaiting one completion future.
///
/// A close future is typically cloned and awaited from several tasks at once,
/// so a single waker slot is not enough. Re-polling from the same task
/// replaces nothing and adds nothing.
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    wakers: Vec<Waker>,
}

impl WakerSet {
    /// Remember `waker` unless an equivalent one is already registered.
    pub(crate) fn register(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    /// Remove and return every registered waker.
    pub(crate) fn take(&mut self) -> Vec<Waker> {
        std::mem::take(&mut self.wakers)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn same_waker_registered_once() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());

        let mut set = WakerSet::default();
        set.register(&waker);
        set.register(&waker);
        assert_eq!(set.len(), 1);

        for w in set.take() {
            w.wake();
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn distinct_wakers_all_kept() {
        let a = Waker::from(Arc::new(CountingWaker(AtomicUsize::new(0))));
        let b = Waker::from(Arc::new(CountingWaker(AtomicUsize::new(0))));

        let mut set = WakerSet::default();
        set.register(&a);
        set.register(&b);
        assert_eq!(set.len(), 2);
    }
}

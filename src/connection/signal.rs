use parking_lot::{Condvar, Mutex};

/// Counting semaphore that wakes the sender thread.
///
/// Posted once per enqueued message and once per state change, so a waiting
/// sender always observes new work or a stop request.
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }
}

//! Counting semaphore with a runtime-adjustable limit.
//!
//! `tokio::sync::Semaphore` can add permits but cannot take them back from
//! holders, so shrinking is expressed here as a lower `max` that new
//! acquirers observe while current holders drain.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug)]
struct Counts {
    current: usize,
    max: usize,
}

#[derive(Debug)]
pub struct DynamicSemaphore {
    counts: Mutex<Counts>,
    notify: Notify,
}

impl DynamicSemaphore {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(Counts {
                current: 0,
                max: max.max(1),
            }),
            notify: Notify::new(),
        })
    }

    /// Wait until `current < max`, then take a slot.
    pub async fn acquire(self: &Arc<Self>) -> DynamicPermit {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await is not missed.
            notified.as_mut().enable();

            {
                let mut counts = self.counts.lock();
                if counts.current < counts.max {
                    counts.current += 1;
                    return DynamicPermit {
                        semaphore: self.clone(),
                    };
                }
            }

            notified.await;
        }
    }

    fn release(&self) {
        {
            let mut counts = self.counts.lock();
            counts.current = counts.current.saturating_sub(1);
        }
        self.notify.notify_one();
    }

    /// Change the limit. Growing wakes every waiter; shrinking leaves current
    /// holders alone, so `in_use()` may exceed `max()` until they finish.
    pub fn set_max(&self, max: usize) {
        let max = max.max(1);
        let grew = {
            let mut counts = self.counts.lock();
            let grew = max > counts.max;
            counts.max = max;
            grew
        };
        if grew {
            self.notify.notify_waiters();
        }
    }

    pub fn max(&self) -> usize {
        self.counts.lock().max
    }

    pub fn in_use(&self) -> usize {
        self.counts.lock().current
    }
}

/// Slot held for the duration of one AI call. Released on drop.
#[derive(Debug)]
pub struct DynamicPermit {
    semaphore: Arc<DynamicSemaphore>,
}

impl Drop for DynamicPermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

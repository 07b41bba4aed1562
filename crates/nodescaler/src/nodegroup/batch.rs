use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Splits `count` launches into sequential cycles of at most `max_per_cycle` nodes.
/// A zero limit runs everything in a single cycle.
pub fn plan_cycles(count: usize, max_per_cycle: usize) -> Vec<usize> {
    if count == 0 {
        return vec![];
    }
    let max_per_cycle = if max_per_cycle == 0 {
        count
    } else {
        max_per_cycle
    };
    (0..count.div_ceil(max_per_cycle))
        .map(|cycle| max_per_cycle.min(count - cycle * max_per_cycle))
        .collect()
}

/// Counts launches that were accepted but have not finished yet.
#[derive(Default, Clone)]
pub struct InflightCounter {
    inner: Arc<InflightInner>,
}

#[derive(Default)]
struct InflightInner {
    count: AtomicUsize,
    idle: Notify,
}

impl InflightCounter {
    pub fn enter(&self) -> InflightGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolves once no launch is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct InflightGuard {
    inner: Arc<InflightInner>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

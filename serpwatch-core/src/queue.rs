use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// Pending units of one run, shared by every worker.
///
/// Units are loaded once and the sending side is closed right away, so a
/// drained queue answers `None` immediately instead of waiting.
#[derive(Debug)]
pub struct WorkQueue<T> {
    receiver: Mutex<mpsc::UnboundedReceiver<T>>,
    dispatched: usize,
    taken: AtomicUsize,
}

impl<T> WorkQueue<T> {
    pub fn new(mut units: Vec<T>, shuffle: bool) -> Self {
        if shuffle {
            units.shuffle(&mut rand::thread_rng());
        }
        let dispatched = units.len();
        let (sender, receiver) = mpsc::unbounded_channel();
        for unit in units {
            // The receiver is alive, so sending cannot fail here.
            let _ = sender.send(unit);
        }
        drop(sender);
        Self {
            receiver: Mutex::new(receiver),
            dispatched,
            taken: AtomicUsize::new(0),
        }
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Whether every unit has been handed out.
    pub fn is_drained(&self) -> bool {
        self.taken.load(Ordering::SeqCst) >= self.dispatched
    }

    /// Next unit, or `None` once the queue is drained or `poll` elapsed
    /// while other workers held it.
    pub async fn take(&self, poll: Duration) -> Option<T> {
        timeout(poll, async {
            let mut receiver = self.receiver.lock().await;
            let unit = receiver.recv().await?;
            self.taken.fetch_add(1, Ordering::SeqCst);
            Some(unit)
        })
        .await
        .ok()
        .flatten()
    }
}

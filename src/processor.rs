//! Ordered task execution and request coalescing.
//!
//! A [`Processor`] runs closures one at a time, in submission order, on a
//! tokio task. [`SingleFlight`] collapses bursts of "work is available"
//! signals into as few drain passes as possible.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Sequential task queue.
///
/// Tasks may be submitted from any thread. They never run concurrently with
/// each other, so everything scheduled through one processor observes a
/// single-threaded order.
pub struct Processor {
    tx: mpsc::UnboundedSender<Task>,
    worker: JoinHandle<()>,
}

impl Processor {
    /// Spawn the worker on the given runtime.
    pub fn new(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let worker = handle.spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
            log::trace!("processor worker exiting");
        });
        Self { tx, worker }
    }

    /// Queue a task. Returns false if the worker has stopped.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }

    /// Wait until every task queued before this call has run.
    pub async fn join(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.enqueue(move || {
            let _ = done_tx.send(());
        }) {
            let _ = done_rx.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.worker.is_finished() && !self.tx.is_closed()
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Pending-request counter for a coalesced drain.
///
/// Every signal calls [`request`](Self::request); only the one that finds no
/// pending work schedules a drain. The drain runs through
/// [`run`](Self::run), which makes one more pass for signals that arrived
/// while a pass was in progress.
#[derive(Debug, Default)]
pub struct SingleFlight {
    pending: AtomicUsize,
}

impl SingleFlight {
    pub const fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
        }
    }

    /// Register a request. Returns true if the caller must schedule a drain.
    pub fn request(&self) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Undo a request whose drain could not be scheduled.
    pub fn cancel(&self) {
        self.pending.store(0, Ordering::Release);
    }

    /// Drain until no request arrives during a pass. Returns the pass count.
    pub fn run(&self, mut work: impl FnMut()) -> usize {
        let mut passes = 0;
        loop {
            // Requests queued before this pass are all served by it.
            self.pending.store(1, Ordering::Release);
            work();
            passes += 1;
            if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                return passes;
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_burst_collapses_to_one_pass() {
        let flight = SingleFlight::new();
        assert!(flight.request());
        assert!(!flight.request());
        assert!(!flight.request());

        let passes = flight.run(|| {});
        assert_eq!(passes, 1);
        assert_eq!(flight.pending(), 0);
        assert!(flight.request());
    }

    #[test]
    fn test_request_during_pass_adds_one_pass() {
        let flight = Arc::new(SingleFlight::new());
        assert!(flight.request());

        let mut first = true;
        let inner = flight.clone();
        let passes = flight.run(|| {
            if first {
                first = false;
                assert!(!inner.request());
                assert!(!inner.request());
            }
        });
        assert_eq!(passes, 2);
        assert_eq!(flight.pending(), 0);
    }

    #[test]
    fn test_cancel_allows_rescheduling() {
        let flight = SingleFlight::new();
        assert!(flight.request());
        flight.cancel();
        assert!(flight.request());
    }

    #[tokio::test]
    async fn test_processor_runs_in_submission_order() {
        let processor = Processor::new(&Handle::current());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            assert!(processor.enqueue(move || seen.lock().unwrap().push(i)));
        }
        processor.join().await;
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }
}

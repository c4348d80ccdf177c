//! Background RDS worker.
//!
//! The pipeline thread must never stall on RDS math, so MPX blocks are
//! handed to a dedicated worker over a bounded queue. Under overload the
//! newest block is dropped - never the oldest - so the decoder keeps an
//! unbroken view of the stream and its block sync survives. A reset
//! request flushes the queue atomically and re-initializes the decoder
//! before the next block is touched.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::rds::{RdsDecoder, RdsGroup};

/// Queue capacity in MPX blocks.
const QUEUE_LIMIT: usize = 32;

/// Condvar wait timeout; the worker re-checks liveness at this cadence.
const WAKE_INTERVAL: Duration = Duration::from_millis(50);

pub type GroupCallback = Box<dyn FnMut(&RdsGroup) + Send>;

struct Shared {
    queue: Mutex<VecDeque<Vec<f32>>>,
    wake: Condvar,
    stop: AtomicBool,
    reset: AtomicBool,
}

/// Owns the RDS decoder thread.
pub struct RdsWorker {
    input_rate: u32,
    shared: Arc<Shared>,
    on_group: Option<GroupCallback>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RdsWorker {
    /// Create a stopped worker; `on_group` runs on the worker thread for
    /// every decoded group.
    pub fn new(input_rate: u32, on_group: GroupCallback) -> Self {
        Self {
            input_rate,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                wake: Condvar::new(),
                stop: AtomicBool::new(false),
                reset: AtomicBool::new(false),
            }),
            on_group: Some(on_group),
            thread: None,
        }
    }

    /// Spawn the worker thread. A second call is a no-op.
    pub fn start(&mut self) {
        if self.thread.is_some() {
            return;
        }
        let on_group = match self.on_group.take() {
            Some(cb) => cb,
            None => return,
        };
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let input_rate = self.input_rate;
        self.thread = Some(
            thread::Builder::new()
                .name("rds-worker".into())
                .spawn(move || run(shared, input_rate, on_group))
                .expect("spawning rds worker thread"),
        );
    }

    /// Signal the worker to finish and join it.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("rds worker thread panicked");
            }
        }
    }

    /// Queue one MPX block for decoding.
    ///
    /// When the queue is full the block is dropped and `false` returned;
    /// the decoder's temporal continuity is worth more than the sample.
    pub fn enqueue(&self, samples: &[f32]) -> bool {
        if samples.is_empty() {
            return false;
        }
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.len() >= QUEUE_LIMIT {
                return false;
            }
            queue.push_back(samples.to_vec());
        }
        self.shared.wake.notify_one();
        true
    }

    /// Flush the queue and have the worker re-initialize its decoder
    /// before processing anything further. Does not stop the thread.
    pub fn request_reset(&self) {
        self.shared.reset.store(true, Ordering::Release);
        self.shared.queue.lock().unwrap().clear();
        self.shared.wake.notify_one();
    }
}

impl Drop for RdsWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, input_rate: u32, mut on_group: GroupCallback) {
    let mut decoder = RdsDecoder::new(input_rate);
    debug!("rds worker running at {} Hz", input_rate);

    loop {
        let (block, do_reset) = {
            let queue = shared.queue.lock().unwrap();
            let (mut queue, _) = shared
                .wake
                .wait_timeout_while(queue, WAKE_INTERVAL, |q| {
                    !shared.stop.load(Ordering::Acquire)
                        && !shared.reset.load(Ordering::Acquire)
                        && q.is_empty()
                })
                .unwrap();

            if shared.stop.load(Ordering::Acquire) {
                break;
            }
            let do_reset = shared.reset.swap(false, Ordering::AcqRel);
            (queue.pop_front(), do_reset)
        };

        if do_reset {
            decoder.reset();
        }
        if let Some(block) = block {
            decoder.process(&block, &mut |group| on_group(group));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_start_stop_joins_quickly() {
        let mut worker = RdsWorker::new(256_000, Box::new(|_| {}));
        worker.start();
        std::thread::sleep(Duration::from_millis(20));
        worker.stop();
    }

    #[test]
    fn test_enqueue_bounded_drop_newest() {
        // Worker not started: blocks pile up and the 33rd is refused
        let worker = RdsWorker::new(256_000, Box::new(|_| {}));
        let block = vec![0.0f32; 64];
        for _ in 0..QUEUE_LIMIT {
            assert!(worker.enqueue(&block));
        }
        assert!(!worker.enqueue(&block));
        // The oldest blocks are still queued
        assert_eq!(worker.shared.queue.lock().unwrap().len(), QUEUE_LIMIT);
    }

    #[test]
    fn test_reset_flushes_queue() {
        let worker = RdsWorker::new(256_000, Box::new(|_| {}));
        let block = vec![0.0f32; 64];
        for _ in 0..8 {
            worker.enqueue(&block);
        }
        worker.request_reset();
        assert!(worker.shared.queue.lock().unwrap().is_empty());
    }

    #[test]
    fn test_worker_drains_queue() {
        let (tx, rx) = mpsc::channel::<usize>();
        let mut worker = RdsWorker::new(256_000, Box::new(move |_| {
            let _ = tx.send(1);
        }));
        worker.start();
        // Silence decodes to nothing, but the queue must drain
        let block = vec![0.0f32; 4096];
        for _ in 0..4 {
            worker.enqueue(&block);
        }
        std::thread::sleep(Duration::from_millis(200));
        assert!(worker.shared.queue.lock().unwrap().is_empty());
        worker.stop();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_enqueue_refused() {
        let worker = RdsWorker::new(256_000, Box::new(|_| {}));
        assert!(!worker.enqueue(&[]));
    }
}

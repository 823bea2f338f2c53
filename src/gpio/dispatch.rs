use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::error;

use crate::gpio::EventCallback;

struct Inner {
    queue: Mutex<VecDeque<EventCallback>>,
    not_empty: Condvar,
    exit: AtomicBool,
}

impl Inner {
    // Worker thread main loop. Callbacks run with the queue lock released,
    // so push() never waits on a long-running callback.
    fn run(&self) {
        let mut queue = self.queue.lock().unwrap();

        loop {
            if self.exit.load(Ordering::SeqCst) {
                break;
            }

            if let Some(callback) = queue.pop_front() {
                drop(queue);

                if panic::catch_unwind(AssertUnwindSafe(|| (*callback.lock().unwrap())())).is_err()
                {
                    error!("GPIO event callback panicked");
                }

                queue = self.queue.lock().unwrap();
            } else {
                queue = self.not_empty.wait(queue).unwrap();
            }
        }
    }
}

/// Single-consumer FIFO that runs submitted callbacks on an owned worker
/// thread, in submission order.
///
/// Dropping the queue waits for the callback that's currently executing,
/// then discards anything still queued without invoking it.
pub(crate) struct DispatchQueue {
    inner: Arc<Inner>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DispatchQueue {
    pub(crate) fn new() -> DispatchQueue {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            exit: AtomicBool::new(false),
        });

        let worker_inner = inner.clone();
        let worker = thread::spawn(move || worker_inner.run());

        DispatchQueue {
            inner,
            worker: Some(worker),
        }
    }

    /// Appends a callback. Any thread may push.
    pub(crate) fn push(&self, callback: EventCallback) {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.push_back(callback);
        }

        self.inner.not_empty.notify_one();
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        {
            // Taking the lock here means the worker can't miss the exit
            // flag between its empty-queue check and the condvar wait.
            let _queue = self.inner.queue.lock().unwrap();
            self.inner.exit.store(true, Ordering::SeqCst);
        }

        self.inner.not_empty.notify_one();

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("queue", &format_args!("{{ .. }}"))
            .field("exit", &self.inner.exit)
            .finish()
    }
}

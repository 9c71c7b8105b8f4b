//! Background closing of buffer objects.
//!
//! Freeing a buffer object may have to wait for the GPU and for the kernel.
//! The worker takes that latency off the freeing thread. Objects still queued
//! at shutdown are closed before the worker exits.

use crate::error::GfxResult;
use crate::memory::buffer_object::BufferObject;
use crate::memory::registry::SharedHandleRegistry;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseWorkerMode {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Default)]
struct Queue {
    objects: VecDeque<Arc<BufferObject>>,
    shutdown: bool,
}

#[derive(Debug)]
struct WorkerShared {
    queue: Mutex<Queue>,
    cond: Condvar,
    in_flight: AtomicUsize,
    registry: Arc<SharedHandleRegistry>,
}

#[derive(Debug)]
pub struct CloseWorker {
    shared: Arc<WorkerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CloseWorker {
    /// Starts the worker thread.
    ///
    /// # Errors
    /// Returns `Io` if the thread cannot be spawned.
    pub fn new(registry: Arc<SharedHandleRegistry>) -> GfxResult<Self> {
        let shared = Arc::new(WorkerShared {
            queue: Mutex::new(Queue::default()),
            cond: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            registry,
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("gfx-close-worker".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues the final close of `bo`. Never blocks on the kernel.
    pub fn push(&self, bo: Arc<BufferObject>) {
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let mut queue = self.shared.queue.lock();
        queue.objects.push_back(bo);
        self.shared.cond.notify_one();
    }

    /// Objects queued or being closed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Asks the worker to stop once the queue is drained. A blocking close waits
    /// for it to finish.
    pub fn close(&self, blocking: bool) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            self.shared.cond.notify_all();
        }

        if blocking {
            if let Some(thread) = self.thread.lock().take() {
                if thread.join().is_err() {
                    tracing::error!("close worker panicked");
                }
            }
        }
    }
}

impl Drop for CloseWorker {
    fn drop(&mut self) {
        self.close(true);
    }
}

impl WorkerShared {
    fn run(&self) {
        tracing::trace!("close worker started");
        loop {
            let bo = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(bo) = queue.objects.pop_front() {
                        break bo;
                    }
                    if queue.shutdown {
                        tracing::trace!("close worker drained");
                        return;
                    }
                    self.cond.wait(&mut queue);
                }
            };
            self.close(&bo);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn close(&self, bo: &Arc<BufferObject>) {
        if let Err(e) = bo.wait(None) {
            tracing::warn!(handle = bo.handle(), error = %e, "wait before close failed");
        }
        self.registry.unreference(bo, true);
    }
}

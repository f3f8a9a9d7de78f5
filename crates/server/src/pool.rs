use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::warn;

struct Queue<T> {
    tasks: VecDeque<T>,
    closed: bool,
}

struct Inner<T> {
    queue: Mutex<Queue<T>>,
    available: Condvar,
}

/// Fixed-size worker set over a FIFO task queue.
///
/// Submission is non-blocking and order-preserving. Workers are joined in
/// `Drop`: each finishes the task it is running, queued but unexecuted tasks
/// are discarded. A panicking task is confined to that task; the worker thread
/// keeps serving.
pub struct TaskPool<T> {
    inner: Arc<Inner<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> TaskPool<T> {
    pub fn new<F>(workers: usize, run: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        assert!(workers > 0);

        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        });
        let run = Arc::new(run);

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let inner = Arc::clone(&inner);
            let run = Arc::clone(&run);
            let handle = std::thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || worker_loop(inner, run))
                .context("spawn pool worker")?;
            handles.push(handle);
        }

        Ok(Self {
            inner,
            workers: handles,
        })
    }

    pub fn submit(&self, task: T) {
        let mut queue = lock(&self.inner.queue);
        if queue.closed {
            return;
        }
        queue.tasks.push_back(task);
        drop(queue);
        self.inner.available.notify_one();
    }
}

fn worker_loop<T, F: Fn(T)>(inner: Arc<Inner<T>>, run: Arc<F>) {
    loop {
        let task = {
            let mut queue = lock(&inner.queue);
            loop {
                if queue.closed {
                    return;
                }
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                queue = inner
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| (*run)(task))).is_err() {
            warn!("pool task panicked");
        }
    }
}

impl<T> Drop for TaskPool<T> {
    fn drop(&mut self) {
        lock(&self.inner.queue).closed = true;
        self.inner.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn lock<T>(queue: &Mutex<Queue<T>>) -> MutexGuard<'_, Queue<T>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

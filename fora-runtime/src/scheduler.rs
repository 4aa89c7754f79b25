//! # Callback Scheduler
//!
//! Delivers fire-and-forget callbacks (page-dropped notifications, deferred
//! cache work) off the caller's thread.
//!
//! A pooled scheduler feeds a fixed set of worker threads through an
//! unbounded `crossbeam-channel`; with one worker, callbacks run in
//! submission order. An inline scheduler runs each callback on the
//! submitting thread, which keeps tests deterministic.
//!
//! A panicking callback is logged and does not take its worker down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::config::SchedulerConfig;

/// A unit of scheduled work.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Outstanding callback counter with an idle signal.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

enum Mode {
    Inline,
    Pool {
        sender: Option<Sender<Callback>>,
        workers: Vec<JoinHandle<()>>,
    },
}

/// Runs callbacks inline or on a worker pool.
pub struct CallbackScheduler {
    name: String,
    mode: Mutex<Mode>,
    pending: Arc<Pending>,
}

impl CallbackScheduler {
    /// A scheduler backed by `threads` workers.
    pub fn new(name: impl Into<String>, threads: usize) -> Arc<Self> {
        let name = name.into();
        let (sender, receiver) = unbounded::<Callback>();
        let pending = Arc::new(Pending::default());

        let workers = (0..threads.max(1))
            .filter_map(|i| {
                let receiver = receiver.clone();
                let pending = Arc::clone(&pending);
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        for callback in receiver.iter() {
                            run_guarded(callback);
                            pending.done();
                        }
                    })
                    .map_err(|e| error!(error = %e, "failed to spawn callback worker"))
                    .ok()
            })
            .collect::<Vec<_>>();

        let mode = if workers.is_empty() {
            Mode::Inline
        } else {
            Mode::Pool {
                sender: Some(sender),
                workers,
            }
        };

        Arc::new(Self {
            name,
            mode: Mutex::new(mode),
            pending,
        })
    }

    /// A scheduler that runs every callback on the submitting thread.
    pub fn inline() -> Arc<Self> {
        Arc::new(Self {
            name: "inline".into(),
            mode: Mutex::new(Mode::Inline),
            pending: Arc::new(Pending::default()),
        })
    }

    /// Build from configuration.
    pub fn from_config(name: impl Into<String>, config: &SchedulerConfig) -> Arc<Self> {
        Self::new(name, config.callback_threads)
    }

    /// Scheduler name, used for worker thread names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `callback` for execution.
    pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
        let sender = match &*self.mode.lock() {
            Mode::Inline => None,
            Mode::Pool { sender, .. } => sender.clone(),
        };

        let Some(sender) = sender else {
            run_guarded(Box::new(callback));
            return;
        };

        self.pending.add();
        if let Err(rejected) = sender.send(Box::new(callback)) {
            warn!(scheduler = %self.name, "scheduler shut down, running callback inline");
            run_guarded(rejected.into_inner());
            self.pending.done();
        }
    }

    /// Callbacks queued or running.
    pub fn pending_count(&self) -> usize {
        *self.pending.count.lock()
    }

    /// Block until every callback scheduled so far has finished.
    pub fn block_until_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }

    /// Stop accepting work and join the workers after the queue drains.
    pub fn shutdown(&self) {
        let workers = match &mut *self.mode.lock() {
            Mode::Inline => return,
            Mode::Pool { sender, workers } => {
                sender.take();
                std::mem::take(workers)
            }
        };
        for worker in workers {
            if worker.join().is_err() {
                error!(scheduler = %self.name, "callback worker panicked");
            }
        }
    }
}

impl Drop for CallbackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CallbackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackScheduler")
            .field("name", &self.name)
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn run_guarded(callback: Callback) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("scheduled callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_inline_runs_immediately() {
        let sched = CallbackScheduler::inline();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        sched.schedule(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sched.pending_count(), 0);
    }

    #[test]
    fn test_pool_runs_everything() {
        let sched = CallbackScheduler::new("test-sched", 4);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..500 {
            let h = hits.clone();
            sched.schedule(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.block_until_idle();
        assert_eq!(hits.load(Ordering::SeqCst), 500);
    }

    #[test]
    fn test_single_worker_preserves_order() {
        let sched = CallbackScheduler::new("ordered", 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let s = seen.clone();
            sched.schedule(move || s.lock().push(i));
        }
        sched.block_until_idle();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_callback_does_not_stall() {
        let sched = CallbackScheduler::new("panicky", 1);
        sched.schedule(|| panic!("boom"));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        sched.schedule(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        sched.block_until_idle();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_schedule_after_shutdown_runs_inline() {
        let sched = CallbackScheduler::new("closed", 2);
        sched.shutdown();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        sched.schedule(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

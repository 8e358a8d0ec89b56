//! Background workers: page flusher, checkpointer, purge.
//!
//! Each worker is a plain thread running {pick work, do I/O, sleep on a
//! condition variable}; shutdown sets a flag and notifies, then joins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use oakdb_vfs::Storage;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::engine::Engine;

struct Signal {
    stop: AtomicBool,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    /// Sleep until the interval elapses or shutdown is signalled.
    /// Returns false when the worker should exit.
    fn tick(&self, interval: Duration) -> bool {
        let mut guard = self.mutex.lock();
        if self.stop.load(Ordering::Acquire) {
            return false;
        }
        let _ = self.cond.wait_for(&mut guard, interval);
        !self.stop.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.cond.notify_all();
    }
}

/// Handles of the spawned workers.
pub(crate) struct Workers {
    signal: Arc<Signal>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub(crate) fn spawn<S: Storage>(engine: &Arc<Engine<S>>) -> Self {
        let signal = Signal::new();
        let mut handles = Vec::new();

        // Dirty-page flusher: drains the flush list from its cold end.
        {
            let engine = Arc::clone(engine);
            let signal = Arc::clone(&signal);
            let interval = engine.config.flush_interval;
            handles.push(
                std::thread::Builder::new()
                    .name("oakdb-flush".to_owned())
                    .spawn(move || {
                        while signal.tick(interval) {
                            match engine.pool().flush_batch(64) {
                                Ok(n) if n > 0 => debug!(pages = n, "background flush"),
                                Ok(_) => {}
                                Err(err) => {
                                    warn!(%err, "background flush failed");
                                    if err.is_fatal() {
                                        engine.mark_failed(&err);
                                        break;
                                    }
                                }
                            }
                        }
                    })
                    .expect("spawn flusher"),
            );
        }

        // Checkpointer: periodic, and eager when the ring nears wrap.
        {
            let engine = Arc::clone(engine);
            let signal = Arc::clone(&signal);
            let interval = engine.config.checkpoint_interval;
            handles.push(
                std::thread::Builder::new()
                    .name("oakdb-checkpoint".to_owned())
                    .spawn(move || {
                        while signal.tick(interval) {
                            if engine.log().checkpoint_needed() {
                                // Push the oldest dirty pages out first so
                                // the checkpoint can actually advance.
                                if let Err(err) = engine.pool().flush_batch(128) {
                                    warn!(%err, "pre-checkpoint flush failed");
                                    continue;
                                }
                            }
                            if let Err(err) = engine.checkpoint() {
                                warn!(%err, "checkpoint failed");
                                if err.is_fatal() {
                                    engine.mark_failed(&err);
                                    break;
                                }
                            }
                        }
                    })
                    .expect("spawn checkpointer"),
            );
        }

        // Purge: reclaims history invisible to every view.
        {
            let engine = Arc::clone(engine);
            let signal = Arc::clone(&signal);
            let interval = engine.config.purge_interval;
            handles.push(
                std::thread::Builder::new()
                    .name("oakdb-purge".to_owned())
                    .spawn(move || {
                        while signal.tick(interval) {
                            match engine.purge_step(32) {
                                Ok(n) if n > 0 => debug!(logs = n, "purged history"),
                                Ok(_) => {}
                                Err(err) => {
                                    warn!(%err, "purge failed");
                                    if err.is_fatal() {
                                        engine.mark_failed(&err);
                                        break;
                                    }
                                }
                            }
                        }
                    })
                    .expect("spawn purge"),
            );
        }

        Self { signal, handles }
    }

    pub(crate) fn stop(self) {
        self.signal.shutdown();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

//! Per-key write coalescing.
//!
//! Rapid local mutations (progress taps, structural edits) reschedule a
//! single pending write per key; only the most recent one runs, once its
//! window has passed without a newer schedule.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::DebounceConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceWindow {
    /// Progress pointer moves.
    Progress,
    /// Edits to charts, rounds or stitches.
    Structural,
}

impl DebounceWindow {
    pub fn duration(self, config: &DebounceConfig) -> Duration {
        match self {
            DebounceWindow::Progress => Duration::from_millis(config.progress_ms),
            DebounceWindow::Structural => Duration::from_millis(config.structural_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebounceFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct FlushReport {
    pub flushed: usize,
    pub errors: Vec<DebounceFailure>,
}

struct Pending {
    generation: u64,
    write: BoxFuture<'static, Result<()>>,
    timer: JoinHandle<()>,
}

/// A write whose timer fired; the receiver yields its outcome when claimed.
struct InFlight {
    key: String,
    done: oneshot::Receiver<std::result::Result<(), String>>,
}

struct Inner {
    pending: Mutex<HashMap<String, Pending>>,
    in_flight: Mutex<HashMap<u64, InFlight>>,
    failures: mpsc::UnboundedSender<DebounceFailure>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<u64, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Moves the entry from pending to in flight, only if it still belongs
    /// to `generation`. Both maps change under the pending lock.
    fn take_if_current(
        &self,
        key: &str,
        generation: u64,
    ) -> Option<(BoxFuture<'static, Result<()>>, oneshot::Sender<std::result::Result<(), String>>)> {
        let mut pending = self.lock();
        match pending.get(key) {
            Some(p) if p.generation == generation => {
                let write = pending.remove(key)?.write;
                let (tx, done) = oneshot::channel();
                self.lock_in_flight().insert(
                    generation,
                    InFlight {
                        key: key.to_string(),
                        done,
                    },
                );
                Some((write, tx))
            }
            _ => None,
        }
    }
}

pub struct Debouncer {
    inner: Arc<Inner>,
    config: DebounceConfig,
    next_generation: Mutex<u64>,
}

impl Debouncer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DebounceFailure>) {
        Self::with_config(DebounceConfig::default())
    }

    pub fn with_config(config: DebounceConfig) -> (Self, mpsc::UnboundedReceiver<DebounceFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                failures,
            }),
            config,
            next_generation: Mutex::new(0),
        };
        (debouncer, rx)
    }

    /// Replaces any pending write for `key` and restarts its window.
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: impl Into<String>, window: DebounceWindow, write: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let key = key.into();
        let delay = window.duration(&self.config);
        let generation = {
            let mut next = self.next_generation.lock().unwrap_or_else(|p| p.into_inner());
            *next += 1;
            *next
        };

        let mut pending = self.inner.lock();
        if let Some(previous) = pending.remove(&key) {
            previous.timer.abort();
        }

        let inner = Arc::clone(&self.inner);
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some((write, done)) = inner.take_if_current(&timer_key, generation) else {
                return;
            };
            let outcome = write.await.map_err(|e| e.to_string());

            // a flush that claimed this write reports the outcome itself
            let claimed = inner.lock_in_flight().remove(&generation).is_none();
            if claimed {
                let _ = done.send(outcome);
            } else if let Err(error) = outcome {
                tracing::warn!(key = %timer_key, %error, "debounced write failed");
                let _ = inner.failures.send(DebounceFailure { key: timer_key, error });
            }
        });

        pending.insert(
            key,
            Pending {
                generation,
                write: write.boxed(),
                timer,
            },
        );
    }

    /// Drops the pending write for `key` without running it.
    pub fn cancel(&self, key: &str) -> bool {
        match self.inner.lock().remove(key) {
            Some(p) => {
                p.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Waits for writes whose timer already fired, then runs every pending
    /// write now, in key order.
    pub async fn flush_all(&self) -> FlushReport {
        let (mut drained, mut in_flight) = {
            let mut pending = self.inner.lock();
            let drained: Vec<(String, Pending)> = pending.drain().collect();
            let in_flight: Vec<InFlight> = self.inner.lock_in_flight().drain().map(|(_, f)| f).collect();
            (drained, in_flight)
        };
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        in_flight.sort_by(|a, b| a.key.cmp(&b.key));

        let mut report = FlushReport::default();
        for running in in_flight {
            match running.done.await {
                Ok(Ok(())) => report.flushed += 1,
                Ok(Err(error)) => report.errors.push(DebounceFailure {
                    key: running.key,
                    error,
                }),
                Err(_) => report.errors.push(DebounceFailure {
                    key: running.key,
                    error: "write was interrupted".into(),
                }),
            }
        }
        for (key, pending) in drained {
            pending.timer.abort();
            match pending.write.await {
                Ok(()) => report.flushed += 1,
                Err(e) => report.errors.push(DebounceFailure {
                    key,
                    error: e.to_string(),
                }),
            }
        }
        if !report.errors.is_empty() {
            tracing::warn!(failed = report.errors.len(), "flush had failures");
        }
        report
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> BoxFuture<'static, Result<()>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |value: u32| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(value);
                Ok::<(), Error>(())
            }
            .boxed()
        };
        (log, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_latest_write_runs() {
        let (debouncer, _failures) = Debouncer::new();
        let (log, write) = recorder();

        debouncer.schedule("p1", DebounceWindow::Progress, write(1));
        tokio::time::sleep(Duration::from_millis(600)).await;
        debouncer.schedule("p1", DebounceWindow::Progress, write(2));
        tokio::time::sleep(Duration::from_millis(600)).await;
        debouncer.schedule("p1", DebounceWindow::Progress, write(3));

        assert!(log.lock().unwrap().is_empty(), "window restarts on every schedule");
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(*log.lock().unwrap(), vec![3]);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let (debouncer, _failures) = Debouncer::new();
        let (log, write) = recorder();

        debouncer.schedule("progress", DebounceWindow::Progress, write(1));
        debouncer.schedule("chart", DebounceWindow::Structural, write(2));
        assert_eq!(debouncer.pending_count(), 2);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(*log.lock().unwrap(), vec![1]);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_failure_is_reported() {
        let (debouncer, mut failures) = Debouncer::new();

        debouncer.schedule("p1", DebounceWindow::Progress, async {
            Err::<(), Error>(Error::Network("unavailable".into()))
        });
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.key, "p1");
        assert_eq!(failure.error, "network error: unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_runs_everything_immediately() {
        let (debouncer, mut failures) = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b"] {
            let runs = Arc::clone(&runs);
            debouncer.schedule(key, DebounceWindow::Structural, async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            });
        }
        debouncer.schedule("c", DebounceWindow::Progress, async {
            Err::<(), Error>(Error::Storage("disk full".into()))
        });

        let report = debouncer.flush_all().await;
        assert_eq!(report.flushed, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].key, "c");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(debouncer.pending_count(), 0);

        // aborted timers never fire a second run
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(failures.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_write_already_running() {
        let (debouncer, mut failures) = Debouncer::new();
        let (release, released) = oneshot::channel::<()>();

        debouncer.schedule("p1", DebounceWindow::Progress, async move {
            let _ = released.await;
            Err::<(), Error>(Error::Network("unavailable".into()))
        });
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(debouncer.pending_count(), 0, "timer fired, write is running");

        let (report, _) = tokio::join!(debouncer.flush_all(), async move {
            tokio::task::yield_now().await;
            let _ = release.send(());
        });

        assert_eq!(report.flushed, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].key, "p1");
        assert_eq!(report.errors[0].error, "network error: unavailable");
        assert!(failures.try_recv().is_err(), "claimed failures stay out of the channel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_write() {
        let (debouncer, _failures) = Debouncer::new();
        let (log, write) = recorder();

        debouncer.schedule("p1", DebounceWindow::Progress, write(1));
        assert!(debouncer.cancel("p1"));
        assert!(!debouncer.cancel("p1"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(log.lock().unwrap().is_empty());
    }
}

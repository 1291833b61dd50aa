use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::config::ConnectivityConfig;
use crate::error::{Result, ResultExt};
use crate::remote::RemoteStore;

#[derive(Debug, Clone, Copy)]
struct Probe {
    online: bool,
    at: Instant,
}

/// Connectivity probing with a short-lived cache, plus connection cycling.
pub struct ConnectionController<R: RemoteStore> {
    remote: Arc<R>,
    config: ConnectivityConfig,
    last_probe: Mutex<Option<Probe>>,
}

impl<R: RemoteStore> ConnectionController<R> {
    pub fn new(remote: Arc<R>, config: ConnectivityConfig) -> Self {
        Self {
            remote,
            config,
            last_probe: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<Probe> {
        *self.last_probe.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ttl(&self, online: bool) -> Duration {
        if online {
            self.config.cache_ttl()
        } else {
            self.config.failed_probe_ttl()
        }
    }

    /// Cached answer when fresh, otherwise a live probe.
    pub async fn is_online(&self) -> bool {
        if let Some(probe) = self.cached() {
            if probe.at.elapsed() < self.ttl(probe.online) {
                return probe.online;
            }
        }
        self.probe().await
    }

    /// Always hits the remote.
    pub async fn probe(&self) -> bool {
        let online = self.remote.test_connection().await;
        *self.last_probe.lock().unwrap_or_else(|p| p.into_inner()) = Some(Probe {
            online,
            at: Instant::now(),
        });
        tracing::debug!(online, "connectivity probed");
        online
    }

    pub fn invalidate(&self) {
        *self.last_probe.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Disables then re-enables the client's network layer and re-probes.
    /// Callers must not overlap restarts.
    pub async fn restart_connection(&self) -> Result<bool> {
        tracing::info!("restarting remote connection");
        self.remote
            .disable_network()
            .await
            .context("failed to disable network")?;
        sleep(self.config.restart_pause()).await;
        self.remote
            .enable_network()
            .await
            .context("failed to enable network")?;
        sleep(self.config.restart_settle()).await;

        self.invalidate();
        Ok(self.probe().await)
    }

    /// Polls until the remote answers or the timeout runs out.
    pub async fn wait_for_reconnection(&self) -> bool {
        let deadline = Instant::now() + self.config.reconnect_timeout();
        loop {
            if self.probe().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!("gave up waiting for reconnection");
                return false;
            }
            sleep(self.config.reconnect_poll().min(deadline - now)).await;
        }
    }
}

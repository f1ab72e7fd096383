//! Connectivity prober.
//!
//! Wraps the transport's health probe with a short-lived cache so that
//! frequent `is_online` checks cost one network round trip per window.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::transport::SyncTransport;

/// Default lifetime of a probe result
pub const DEFAULT_CACHE_WINDOW: Duration = Duration::from_secs(30);

/// Snapshot reported by [`ConnectivityProber::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    pub is_online: bool,
    pub last_check: Option<DateTime<Utc>>,
    /// Round trip of a fresh probe; `None` while offline
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    online: bool,
    observed: Instant,
    at: DateTime<Utc>,
}

/// Cached view of whether the remote is reachable
pub struct ConnectivityProber {
    transport: Arc<dyn SyncTransport>,
    cache_window: Duration,
    last: Mutex<Option<Observation>>,
}

impl ConnectivityProber {
    pub fn new(transport: Arc<dyn SyncTransport>, cache_window: Duration) -> Self {
        Self {
            transport,
            cache_window,
            last: Mutex::new(None),
        }
    }

    /// Cached reachability; probes only when the cache window has passed.
    ///
    /// Concurrent callers share a single probe.
    pub async fn is_online(&self) -> bool {
        let mut last = self.last.lock().await;
        if let Some(observation) = *last {
            if observation.observed.elapsed() < self.cache_window {
                return observation.online;
            }
        }
        let online = self.transport.probe().await;
        *last = Some(Observation::now(online));
        online
    }

    /// Probe now regardless of the cache
    pub async fn refresh(&self) -> bool {
        let mut last = self.last.lock().await;
        let online = self.transport.probe().await;
        *last = Some(Observation::now(online));
        online
    }

    /// Fresh probe with latency measurement
    pub async fn status(&self) -> ConnectivityStatus {
        let started = Instant::now();
        let is_online = self.refresh().await;
        let latency = started.elapsed();
        let last_check = self.last.lock().await.map(|observation| observation.at);

        ConnectivityStatus {
            is_online,
            last_check,
            latency_ms: is_online.then(|| u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Last observed state without probing
    pub async fn last_known(&self) -> Option<bool> {
        self.last.lock().await.map(|observation| observation.online)
    }

    /// Probe every `period` and call `on_change` on each transition.
    ///
    /// The last known state (or else the first probe) is the baseline and is
    /// not reported. The loop ends when `cancel` fires.
    pub fn monitor<F, Fut>(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
        mut on_change: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(bool) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let prober = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut previous = prober.last_known().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let online = prober.refresh().await;
                if previous.is_some_and(|was_online| was_online != online) {
                    if online {
                        tracing::info!("Remote reachable again");
                    } else {
                        tracing::warn!("Remote unreachable");
                    }
                    on_change(online).await;
                }
                previous = Some(online);
            }
            tracing::debug!("Connectivity monitor stopped");
        })
    }
}

impl Observation {
    fn now(online: bool) -> Self {
        Self {
            online,
            observed: Instant::now(),
            at: Utc::now(),
        }
    }
}

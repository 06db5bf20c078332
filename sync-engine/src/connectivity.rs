use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Probes `GET <base>/health`. Any 2xx counts as reachable.
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::TransientNetwork(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, url: format!("{}/health", base_url.trim_end_matches('/')) })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Reachability set by hand, for demos and tests.
#[derive(Default)]
pub struct ManualProbe {
    reachable: AtomicBool,
}

impl ManualProbe {
    pub fn new(reachable: bool) -> Self {
        Self { reachable: AtomicBool::new(reachable) }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReachabilityProbe for ManualProbe {
    async fn check(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Debounce {
    online: bool,
    streak: u32,
}

/// Debounced reachability. A new state has to be observed `stable_checks`
/// times in a row before it is reported, and each transition is published
/// exactly once.
pub struct ConnectivityMonitor {
    stable_checks: u32,
    state: Mutex<Debounce>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(stable_checks: u32) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            stable_checks: stable_checks.max(1),
            state: Mutex::new(Debounce::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, Debounce> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.state().online
    }

    /// Feeds one raw reachability sample. Returns the transition it caused,
    /// if any, after publishing it.
    pub fn observe(&self, reachable: bool) -> Option<ConnectivityEvent> {
        let event = {
            let mut state = self.state();
            if reachable == state.online {
                state.streak = 0;
                return None;
            }
            state.streak += 1;
            if state.streak < self.stable_checks {
                return None;
            }
            state.online = reachable;
            state.streak = 0;
            if reachable { ConnectivityEvent::Online } else { ConnectivityEvent::Offline }
        };
        info!(?event, "connectivity changed");
        let _ = self.events.send(event);
        Some(event)
    }

    pub async fn poll_once(&self, probe: &dyn ReachabilityProbe) -> Option<ConnectivityEvent> {
        let reachable = probe.check().await;
        self.observe(reachable)
    }

    /// Polls `probe` every `interval` until the task is dropped or aborted.
    pub async fn run(&self, probe: &dyn ReachabilityProbe, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once(probe).await;
        }
    }
}

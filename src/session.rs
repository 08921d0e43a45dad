use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command as TokioCommand;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::InstanceLocator;

pub const SESSION_EVENT_CAPACITY: usize = 256;
pub const TUNNEL_REMOTE_PORT: u16 = 22;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started(InstanceLocator),
    Ended(InstanceLocator),
}

/// Broadcast channel carrying tunnel lifecycle events. Anything may publish;
/// the tracker and the UI loop subscribe independently.
#[derive(Debug, Clone)]
pub struct SessionEventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

/// Answers "is there a live session for this instance right now". Used to
/// seed connection state when an instance first appears in the tree.
pub trait SessionBroker: Send + Sync {
    fn is_connected(&self, locator: &InstanceLocator) -> bool;
}

#[derive(Default)]
struct TrackerState {
    known: HashSet<InstanceLocator>,
    connected: HashSet<InstanceLocator>,
}

/// Connection state for instances currently loaded in the tree. Events for
/// instances that were never registered (or were forgotten on invalidation)
/// are dropped, so a later load re-seeds from the broker instead of trusting
/// stale history.
#[derive(Clone)]
pub struct ConnectionTracker {
    state: Arc<Mutex<TrackerState>>,
    broker: Arc<dyn SessionBroker>,
}

impl ConnectionTracker {
    pub fn new(broker: Arc<dyn SessionBroker>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            broker,
        }
    }

    pub fn register(&self, locator: &InstanceLocator) {
        let seeded = self.broker.is_connected(locator);
        let mut state = self.lock_state();
        state.known.insert(locator.clone());
        if seeded {
            state.connected.insert(locator.clone());
        } else {
            state.connected.remove(locator);
        }
    }

    pub fn forget(&self, locator: &InstanceLocator) {
        let mut state = self.lock_state();
        state.known.remove(locator);
        state.connected.remove(locator);
    }

    pub fn apply(&self, event: SessionEvent) {
        let mut state = self.lock_state();
        match event {
            SessionEvent::Started(locator) => {
                if state.known.contains(&locator) {
                    state.connected.insert(locator);
                }
            }
            SessionEvent::Ended(locator) => {
                state.connected.remove(&locator);
            }
        }
    }

    pub fn is_connected(&self, locator: &InstanceLocator) -> bool {
        self.lock_state().connected.contains(locator)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct TunnelHandle {
    pid: u32,
    cancel: CancellationToken,
}

/// Spawns and supervises `gcloud compute start-iap-tunnel` children, one per
/// instance. Each child gets a reaper task that publishes `Ended` when the
/// process exits, whether it died on its own or was disconnected here.
pub struct TunnelManager {
    binary: String,
    bus: SessionEventBus,
    active: Arc<Mutex<HashMap<InstanceLocator, TunnelHandle>>>,
}

impl TunnelManager {
    pub fn new(binary: impl Into<String>, bus: SessionEventBus) -> Self {
        Self {
            binary: binary.into(),
            bus,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn connect(&self, locator: &InstanceLocator) -> Result<u32> {
        if self.is_connected(locator) {
            anyhow::bail!("tunnel already active for {locator}");
        }

        let mut cmd = TokioCommand::new(&self.binary);
        for arg in tunnel_args(locator) {
            cmd.arg(arg);
        }
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn IAP tunnel for {locator}"))?;
        let pid = child
            .id()
            .context("failed to determine process id for IAP tunnel")?;

        let cancel = CancellationToken::new();
        {
            let mut active = lock_active(&self.active);
            if active.contains_key(locator) {
                // lost the race to a concurrent connect; kill_on_drop reaps
                // the extra child when it falls out of scope
                anyhow::bail!("tunnel already active for {locator}");
            }
            active.insert(
                locator.clone(),
                TunnelHandle {
                    pid,
                    cancel: cancel.clone(),
                },
            );
        }
        self.bus.publish(SessionEvent::Started(locator.clone()));

        let bus = self.bus.clone();
        let active = Arc::clone(&self.active);
        let locator = locator.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(error) = child.kill().await {
                        warn!("failed to kill IAP tunnel for {locator}: {error}");
                    }
                }
                result = child.wait() => match result {
                    Ok(status) => debug!("IAP tunnel for {locator} exited: {status}"),
                    Err(error) => warn!("IAP tunnel wait failed for {locator}: {error}"),
                }
            }
            let removed = {
                let mut active = lock_active(&active);
                match active.get(&locator) {
                    Some(handle) if handle.pid == pid => active.remove(&locator).is_some(),
                    _ => false,
                }
            };
            if removed {
                bus.publish(SessionEvent::Ended(locator));
            }
        });

        Ok(pid)
    }

    pub fn disconnect(&self, locator: &InstanceLocator) -> Result<()> {
        let active = lock_active(&self.active);
        let handle = active
            .get(locator)
            .with_context(|| format!("no active tunnel for {locator}"))?;
        handle.cancel.cancel();
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        lock_active(&self.active).len()
    }
}

impl SessionBroker for TunnelManager {
    fn is_connected(&self, locator: &InstanceLocator) -> bool {
        lock_active(&self.active).contains_key(locator)
    }
}

fn lock_active(
    active: &Mutex<HashMap<InstanceLocator, TunnelHandle>>,
) -> std::sync::MutexGuard<'_, HashMap<InstanceLocator, TunnelHandle>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn tunnel_args(locator: &InstanceLocator) -> Vec<String> {
    vec![
        "compute".to_string(),
        "start-iap-tunnel".to_string(),
        locator.name.clone(),
        TUNNEL_REMOTE_PORT.to_string(),
        "--local-host-port=localhost:0".to_string(),
        "--zone".to_string(),
        locator.zone.clone(),
        "--project".to_string(),
        locator.project.clone(),
    ]
}

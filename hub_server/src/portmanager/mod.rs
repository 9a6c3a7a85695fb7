//! Serial port discovery, reconnection, and fan-out/fan-in to connected
//! panels: a 200 ms reconciliation tick that diffs the OS port list
//! against desired state, opens/closes [`serialconn::SerialConn`]s
//! accordingly, and notifies subscribers of any resulting change.

pub mod serialconn;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use hub_common::config::ConfigDir;
use hub_common::core::SubscriberGuard;

pub use serialconn::{ConnState, InputCommand, SerialConn};

const RECONCILE_PERIOD: Duration = Duration::from_millis(200);
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 4;

/// Persisted/runtime preference for one port.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PortPreference {
    /// Persisted: connect automatically whenever this port appears.
    pub auto_connect: bool,
    /// Runtime: whether a connection attempt should currently be made.
    pub should_be_connected: bool,
}

/// Full state of one known port, as reported to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortState {
    #[serde(flatten)]
    pub preference: PortPreference,
    pub is_connected: bool,
    pub is_present: bool,
    #[serde(skip)]
    conn: Option<SerialConn>,
}

impl Default for PortState {
    fn default() -> Self {
        Self {
            preference: PortPreference::default(),
            is_connected: false,
            is_present: false,
            conn: None,
        }
    }
}

/// Port name -> state, as delivered to `monitor_serial_ports` subscribers.
pub type PortStateSnapshot = BTreeMap<String, PortState>;

#[derive(Serialize, Deserialize, Default)]
struct ComportsConfigFile {
    #[serde(rename = "autoConnect")]
    auto_connect: Vec<String>,
}

struct Inner {
    ports: BTreeMap<String, PortState>,
    dirty: bool,
}

/// Discovers, connects, and fans data in/out of serial panels.
pub struct PortManager {
    inner: Mutex<Inner>,
    subscribers: Mutex<Vec<SubscriberGuard<PortStateSnapshot>>>,
    input_tx: mpsc::Sender<InputCommand>,
    config_dir: ConfigDir,
    autoconnect_default: bool,
}

impl PortManager {
    /// Build a manager backed by `config_dir` for `comports.json`
    /// persistence. `autoconnect_default` seeds the auto-connect preference
    /// of any port discovered without a persisted or previously-set
    /// preference (the `--autorun-mode` flag's effect). Returns the manager
    /// alongside the receiving end of its fanned-in `InputCommand` stream.
    pub fn new(config_dir: ConfigDir, autoconnect_default: bool) -> (Self, mpsc::Receiver<InputCommand>) {
        let (input_tx, input_rx) = mpsc::channel(256);
        let manager = Self {
            inner: Mutex::new(Inner {
                ports: BTreeMap::new(),
                dirty: false,
            }),
            subscribers: Mutex::new(Vec::new()),
            input_tx,
            config_dir,
            autoconnect_default,
        };
        (manager, input_rx)
    }

    /// Load `comports.json` and pre-seed every listed port as auto-connect.
    pub fn load_persisted_preferences(&self) {
        let Ok(file) = self.config_dir.load::<ComportsConfigFile>("comports.json") else {
            return;
        };
        let mut inner = self.inner.lock().expect("port manager lock poisoned");
        for port_name in file.auto_connect {
            let state = inner.ports.entry(port_name).or_default();
            state.preference.auto_connect = true;
            state.preference.should_be_connected = true;
        }
    }

    fn persist_preferences(&self, inner: &Inner) {
        let auto_connect = inner
            .ports
            .iter()
            .filter(|(_, s)| s.preference.auto_connect)
            .map(|(name, _)| name.clone())
            .collect();
        if let Err(e) = self.config_dir.store("comports.json", &ComportsConfigFile { auto_connect }) {
            log::warn!("failed to persist comports.json: {e}");
        }
    }

    /// Update one port's preference, persisting the auto-connect set.
    pub fn set_port_preference(&self, port_name: &str, preference: PortPreference) {
        let mut inner = self.inner.lock().expect("port manager lock poisoned");
        inner.ports.entry(port_name.to_string()).or_default().preference = preference;
        inner.dirty = true;
        self.persist_preferences(&inner);
    }

    /// Register a new subscriber, immediately delivering the current snapshot.
    pub fn subscribe(&self) -> mpsc::Receiver<PortStateSnapshot> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let snapshot = self.snapshot();
        let _ = tx.try_send(snapshot);
        self.subscribers.lock().expect("subscriber lock poisoned").push(SubscriberGuard::new(tx));
        rx
    }

    pub fn snapshot(&self) -> PortStateSnapshot {
        self.inner.lock().expect("port manager lock poisoned").ports.clone()
    }

    /// Write `data` to every currently connected panel. A write failing on
    /// one port never affects the others; the next tick observes the
    /// resulting closed state.
    pub fn write(&self, data: &[u8]) {
        let inner = self.inner.lock().expect("port manager lock poisoned");
        for state in inner.ports.values() {
            if let Some(conn) = &state.conn {
                if conn.state() != ConnState::Closed {
                    conn.write(data.to_vec());
                }
            }
        }
    }

    /// Run the 200 ms reconciliation tick until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(RECONCILE_PERIOD);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("port manager shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }
    }

    async fn reconcile(&self) {
        let available: Vec<String> = match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                log::warn!("could not get serial port list: {e}");
                Vec::new()
            }
        };
        self.reconcile_with_available_ports(available).await;
    }

    /// Core of [`Self::reconcile`], taking the OS port list as a parameter
    /// instead of asking `serialport` for it. Lets tests drive reconciliation
    /// against a chosen port list without touching real hardware.
    pub async fn reconcile_with_available_ports(&self, available: Vec<String>) {
        let notify = {
            let mut inner = self.inner.lock().expect("port manager lock poisoned");
            let Inner { ports, dirty } = &mut *inner;

            for state in ports.values_mut() {
                if state.is_connected && state.conn.as_ref().map(|c| c.state()) == Some(ConnState::Closed) {
                    state.conn = None;
                    state.is_connected = false;
                    *dirty = true;
                }
            }

            for state in ports.values_mut() {
                if let Some(conn) = &state.conn {
                    if !state.is_connected && conn.state() == ConnState::Open {
                        state.is_connected = true;
                        *dirty = true;
                    }
                }
            }

            let mut to_remove = Vec::new();
            for (name, state) in ports.iter_mut() {
                if !available.contains(name) {
                    if state.preference.auto_connect {
                        if state.is_present {
                            state.is_present = false;
                            *dirty = true;
                        }
                    } else {
                        to_remove.push(name.clone());
                    }
                }
            }
            for name in to_remove {
                ports.remove(&name);
                *dirty = true;
            }

            for port_name in &available {
                let is_new = !ports.contains_key(port_name);
                let state = ports.entry(port_name.clone()).or_default();
                if is_new {
                    state.preference.auto_connect = self.autoconnect_default;
                }
                if !state.is_present {
                    state.is_present = true;
                    state.preference.should_be_connected = state.preference.auto_connect;
                    *dirty = true;
                }

                if !state.preference.should_be_connected && state.is_connected {
                    if let Some(conn) = &state.conn {
                        conn.close();
                    }
                } else if state.preference.should_be_connected && state.conn.is_none() {
                    let conn = SerialConn::open(port_name.clone(), self.input_tx.clone());
                    state.conn = Some(conn);
                    state.is_connected = false;
                    *dirty = true;
                }
            }

            if inner.dirty {
                inner.dirty = false;
                true
            } else {
                false
            }
        };

        if notify {
            self.notify_subscribers().await;
        }
    }

    async fn notify_subscribers(&self) {
        let snapshot = self.snapshot();
        let guards: Vec<_> = self.subscribers.lock().expect("subscriber lock poisoned").clone();
        for guard in &guards {
            guard.try_notify(snapshot.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_dir(label: &str) -> ConfigDir {
        let dir = ConfigDir::new(std::env::temp_dir().join(format!("portmanager-test-{label}-{}", std::process::id())));
        dir.ensure_exists().unwrap();
        dir
    }

    #[tokio::test]
    async fn set_preference_persists_and_is_readable() {
        let dir = temp_config_dir("persist");
        let (manager, _rx) = PortManager::new(dir.clone(), false);
        manager.set_port_preference(
            "COM3",
            PortPreference {
                auto_connect: true,
                should_be_connected: true,
            },
        );

        let snapshot = manager.snapshot();
        assert!(snapshot["COM3"].preference.auto_connect);

        let (manager2, _rx2) = PortManager::new(dir.clone(), false);
        manager2.load_persisted_preferences();
        let snapshot2 = manager2.snapshot();
        assert!(snapshot2["COM3"].preference.auto_connect);

        std::fs::remove_dir_all(dir.root()).ok();
    }

    #[tokio::test]
    async fn setting_the_same_preference_twice_is_idempotent() {
        let dir = temp_config_dir("idempotent");
        let (manager, _rx) = PortManager::new(dir.clone(), false);
        let preference = PortPreference {
            auto_connect: true,
            should_be_connected: true,
        };

        manager.set_port_preference("COM5", preference);
        let first = manager.snapshot();
        manager.set_port_preference("COM5", preference);
        let second = manager.snapshot();

        assert_eq!(first.len(), second.len());
        assert_eq!(first["COM5"].preference.auto_connect, second["COM5"].preference.auto_connect);
        assert_eq!(first["COM5"].preference.should_be_connected, second["COM5"].preference.should_be_connected);

        std::fs::remove_dir_all(dir.root()).ok();
    }

    #[tokio::test]
    async fn reconciling_the_same_port_list_twice_is_idempotent() {
        let dir = temp_config_dir("reconcile-idempotent");
        let (manager, _rx) = PortManager::new(dir.clone(), false);

        let ports = vec!["COM7".to_string()];
        manager.reconcile_with_available_ports(ports.clone()).await;
        let first = manager.snapshot();
        manager.reconcile_with_available_ports(ports).await;
        let second = manager.snapshot();

        assert_eq!(first.len(), second.len());
        assert!(first.contains_key("COM7"));
        assert_eq!(first["COM7"].is_present, second["COM7"].is_present);

        std::fs::remove_dir_all(dir.root()).ok();
    }

    #[tokio::test]
    async fn autoconnect_default_seeds_newly_discovered_ports() {
        let dir = temp_config_dir("autoconnect-default");
        let (manager, _rx) = PortManager::new(dir.clone(), true);

        manager.reconcile_with_available_ports(vec!["COM8".to_string()]).await;
        let snapshot = manager.snapshot();
        assert!(snapshot["COM8"].preference.auto_connect);
        assert!(snapshot["COM8"].preference.should_be_connected);

        std::fs::remove_dir_all(dir.root()).ok();
    }

    #[tokio::test]
    async fn subscribe_delivers_initial_snapshot() {
        let dir = temp_config_dir("subscribe");
        let (manager, _rx) = PortManager::new(dir.clone(), false);
        manager.set_port_preference("COM1", PortPreference::default());

        let mut sub_rx = manager.subscribe();
        let snapshot = sub_rx.recv().await.expect("initial snapshot");
        assert!(snapshot.contains_key("COM1"));

        std::fs::remove_dir_all(dir.root()).ok();
    }
}

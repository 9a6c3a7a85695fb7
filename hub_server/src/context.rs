//! The shared application context: two runtime toggles and a status
//! snapshot for the tray UI, threaded through constructors instead of
//! living as global statics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Point-in-time status the tray UI polls or is pushed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrayStatusInfo {
    pub sim_connected: bool,
    pub connected_port_count: usize,
    pub http_port: u16,
}

/// Shared, cheaply-clonable application state: runtime toggles plus the
/// latest tray status snapshot.
#[derive(Clone)]
pub struct AppContext {
    external_network_access: std::sync::Arc<AtomicBool>,
    lua_console_enabled: std::sync::Arc<AtomicBool>,
    tray_status: std::sync::Arc<Mutex<TrayStatusInfo>>,
}

impl AppContext {
    pub fn new() -> Self {
        Self {
            external_network_access: std::sync::Arc::new(AtomicBool::new(false)),
            lua_console_enabled: std::sync::Arc::new(AtomicBool::new(true)),
            tray_status: std::sync::Arc::new(Mutex::new(TrayStatusInfo::default())),
        }
    }

    /// Whether `/app/<appname>` static serving should accept requests from
    /// outside loopback. Gates the HTTP edge's bind address and its
    /// path-traversal guard's external-reachability check.
    pub fn external_network_access(&self) -> bool {
        self.external_network_access.load(Ordering::Relaxed)
    }

    pub fn set_external_network_access(&self, enabled: bool) {
        self.external_network_access.store(enabled, Ordering::Relaxed);
    }

    pub fn lua_console_enabled(&self) -> bool {
        self.lua_console_enabled.load(Ordering::Relaxed)
    }

    pub fn set_lua_console_enabled(&self, enabled: bool) {
        self.lua_console_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn tray_status(&self) -> TrayStatusInfo {
        self.tray_status.lock().expect("tray status lock poisoned").clone()
    }

    pub fn update_tray_status(&self, f: impl FnOnce(&mut TrayStatusInfo)) {
        let mut status = self.tray_status.lock().expect("tray status lock poisoned");
        f(&mut status);
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_default_and_update() {
        let ctx = AppContext::new();
        assert!(!ctx.external_network_access());
        ctx.set_external_network_access(true);
        assert!(ctx.external_network_access());
    }

    #[test]
    fn tray_status_updates_are_visible() {
        let ctx = AppContext::new();
        ctx.update_tray_status(|s| s.connected_port_count = 3);
        assert_eq!(ctx.tray_status().connected_port_count, 3);
    }
}

//! Process entry point: wires SimLink, PortManager, Dispatcher, the
//! control-reference store, the JSON-API multiplexer, and the HTTP/
//! WebSocket and Lua-console transports together, then runs until a
//! shutdown signal arrives. A shared shutdown broadcast, one spawned task
//! per subsystem, `tokio::try_join!` at the end.

use std::sync::{Arc, Mutex};

use tokio::signal;

use hub_common::controlref::ControlReferenceStore;
use hub_common::shadow::ShadowStore;
use hub_common::FrameParser;

use hub_server::context::AppContext;
use hub_server::dispatcher::Dispatcher;
use hub_server::portmanager::PortManager;
use hub_server::{config, http, jsonapi, luaconsole, simlink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load_config();

    let config_dir = match cfg.resolve_config_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("could not resolve config directory: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config_dir.ensure_exists() {
        eprintln!("could not create config directory {:?}: {e}", config_dir.root());
        std::process::exit(1);
    }

    if let Err(e) = hub_common::logging::init_logging(&config_dir.logs_dir(), &cfg.log_level) {
        eprintln!("could not initialize logging: {e}");
        std::process::exit(1);
    }

    log::info!("cockpit hub starting, config dir: {:?}", config_dir.root());

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let control_reference = Arc::new(ControlReferenceStore::new());
    load_control_reference_modules(&control_reference, &config_dir);

    let store = Arc::new(ShadowStore::with_control_reference(control_reference.clone()));
    let (parser, frame_rx) = FrameParser::new(store.clone());
    let parser = Arc::new(Mutex::new(parser));

    let (port_manager, serial_commands_rx) = PortManager::new(config_dir.clone(), cfg.autoconnect_default());
    port_manager.load_persisted_preferences();
    let port_manager = Arc::new(port_manager);

    let parser_for_bytes = parser.clone();
    let sim_link = simlink::run(
        cfg.sim_host.clone(),
        cfg.sim_port,
        move |bytes| parser_for_bytes.lock().expect("parser lock poisoned").process_bytes(bytes),
        shutdown_tx.subscribe(),
    )
    .await;

    let dispatcher = Arc::new(Dispatcher::new(sim_link, port_manager.clone()));

    let (api_command_tx, api_command_rx) = tokio::sync::mpsc::channel(64);

    let api = jsonapi::JsonApi::new();
    jsonapi::calls::register_control_reference_calls(&api, control_reference.clone());
    jsonapi::calls::register_control_value_calls(&api, store.clone(), control_reference.clone());
    jsonapi::calls::register_port_manager_calls(&api, port_manager.clone());
    jsonapi::calls::register_dispatcher_calls(&api, dispatcher.clone(), api_command_tx);

    let app_context = AppContext::new();
    app_context.update_tray_status(|status| status.http_port = cfg.http_port);

    let port_manager_handle = {
        let port_manager = port_manager.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { port_manager.run(shutdown_rx).await })
    };

    let dispatcher_handle = {
        let dispatcher = dispatcher.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            dispatcher.run(api_command_rx, serial_commands_rx, frame_rx, shutdown_rx).await;
        })
    };

    let mut http_handle = {
        let api = api.clone();
        let app_context = app_context.clone();
        let app_dir = cfg.app_dir.clone();
        let http_port = cfg.http_port;
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { http::run(http_port, app_dir, api, app_context, shutdown_rx).await })
    };

    let lua_console_handle = {
        let api = api.clone();
        let lua_console_port = cfg.lua_console_port;
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { luaconsole::run(lua_console_port, api, shutdown_rx).await })
    };

    // A failed HTTP bind ends that task immediately, long before any
    // shutdown signal; if we only waited on the signal, the process would
    // hang indefinitely with no HTTP edge and nothing to stop it.
    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            let _ = shutdown_tx.send(());
        }
        result = &mut http_handle => {
            let _ = shutdown_tx.send(());
            if let Ok(Err(e)) = result {
                log::error!("http edge could not start, shutting down: {e}");
                let _ = tokio::try_join!(port_manager_handle, dispatcher_handle, lua_console_handle);
                log::info!("cockpit hub shutdown complete");
                std::process::exit(1);
            }
        }
    }

    let _ = tokio::try_join!(port_manager_handle, dispatcher_handle, http_handle, lua_console_handle);
    log::info!("cockpit hub shutdown complete");
    Ok(())
}

fn load_control_reference_modules(store: &ControlReferenceStore, config_dir: &hub_common::config::ConfigDir) {
    let catalog_dir = config_dir.root().join("control-reference-json");
    let Ok(entries) = std::fs::read_dir(&catalog_dir) else {
        log::info!("no control-reference-json directory at {catalog_dir:?}, starting with an empty catalog");
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Err(e) = store.load_file(&path) {
            log::warn!("failed to load control reference module {path:?}: {e}");
        }
    }
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("ctrl-c received, initiating shutdown");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown");
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

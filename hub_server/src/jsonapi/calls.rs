//! Pre-registered response shapes and the per-subsystem call bindings:
//! control-reference queries, port-state subscription, live export-data
//! subscription, and simulator command send.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use hub_common::controlref::{ControlReferenceStore, IOElement};
use hub_common::shadow::ShadowStore;

use crate::dispatcher::{ApiCommand, Dispatcher};
use crate::portmanager::{PortManager, PortPreference, PortStateSnapshot};

use super::{FollowupSource, JsonApi, ResponseSink};

/// The standard success shape, pre-registered under `"success"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Success {
    pub message: String,
}

/// The standard error shape, pre-registered under `"error"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub message: String,
}

pub(super) fn register_standard_types(api: &JsonApi) {
    api.register_type::<Success>("success");
    api.register_type::<Error>("error");
}

#[derive(Debug, Serialize, Deserialize)]
struct ListModulesRequest {}

#[derive(Debug, Serialize, Deserialize)]
struct ModuleList {
    modules: std::collections::BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueryElementsRequest {
    module: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    search_term: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ElementList {
    elements: Vec<IOElement>,
}

/// Register `control_reference_get_modules` and `control_reference_query_elements`.
pub fn register_control_reference_calls(api: &JsonApi, store: Arc<ControlReferenceStore>) {
    api.register_type::<ListModulesRequest>("control_reference_get_modules");
    api.register_type::<ModuleList>("control_reference_modules");
    api.register_type::<QueryElementsRequest>("control_reference_query_elements");
    api.register_type::<ElementList>("control_reference_elements");

    {
        let store = store.clone();
        api.register_call(
            "control_reference_get_modules",
            move |_req: ListModulesRequest, sink: ResponseSink, _followups: FollowupSource| {
                let store = store.clone();
                async move {
                    sink.send(ModuleList {
                        modules: store.modules_and_categories(),
                    })
                    .await;
                }
            },
        );
    }

    api.register_call(
        "control_reference_query_elements",
        move |req: QueryElementsRequest, sink: ResponseSink, _followups: FollowupSource| {
            let store = store.clone();
            async move {
                let elements = store.query(&req.module, &req.category, &req.search_term);
                sink.send(ElementList { elements }).await;
            }
        },
    );
}

#[derive(Debug, Serialize, Deserialize)]
struct GetControlValueRequest {
    id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlValue {
    id: String,
    integer: Option<i32>,
    string: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SetControlValueRequest {
    id: String,
    #[serde(default)]
    integer: Option<i32>,
    #[serde(default)]
    string: Option<String>,
}

/// Register `get_control_value` and `set_control_value`, the id-addressed
/// read/write path onto the shadow store's integer and string controls.
/// `store` must have been built with [`ShadowStore::with_control_reference`]
/// or every lookup resolves to "unknown control".
pub fn register_control_value_calls(api: &JsonApi, store: Arc<ShadowStore>, control_reference: Arc<ControlReferenceStore>) {
    api.register_type::<GetControlValueRequest>("get_control_value");
    api.register_type::<ControlValue>("control_value");
    api.register_type::<SetControlValueRequest>("set_control_value");

    {
        let store = store.clone();
        let control_reference = control_reference.clone();
        api.register_call(
            "get_control_value",
            move |req: GetControlValueRequest, sink: ResponseSink, _followups: FollowupSource| {
                let store = store.clone();
                let control_reference = control_reference.clone();
                async move {
                    let (integer, string) = {
                        let guard = store.lock();
                        let integer = control_reference.integer_output(&req.id).map(|_| guard.get_integer_by_control(&req.id));
                        let string = control_reference
                            .string_output(&req.id)
                            .map(|_| guard.get_string_by_control(&control_reference, &req.id));
                        (integer, string)
                    };
                    sink.send(ControlValue {
                        id: req.id,
                        integer,
                        string,
                    })
                    .await;
                }
            },
        );
    }

    api.register_call(
        "set_control_value",
        move |req: SetControlValueRequest, sink: ResponseSink, _followups: FollowupSource| {
            let store = store.clone();
            let control_reference = control_reference.clone();
            async move {
                let ok = {
                    let mut guard = store.lock();
                    if let Some(value) = req.integer {
                        guard.set_integer_by_control(&control_reference, &req.id, value)
                    } else if let Some(value) = req.string {
                        guard.set_string_by_control(&control_reference, &req.id, &value)
                    } else {
                        false
                    }
                };
                if ok {
                    sink.send(Success {
                        message: format!("{} updated", req.id),
                    })
                    .await;
                } else {
                    sink.send(Error {
                        message: format!("unknown or invalid control: {}", req.id),
                    })
                    .await;
                }
            }
        },
    );
}

#[derive(Debug, Serialize, Deserialize)]
struct SetPortPreferenceRequest {
    port_name: String,
    auto_connect: bool,
    should_be_connected: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubscribePortStateRequest {}

#[derive(Debug, Serialize, Deserialize)]
struct PortStateUpdate {
    ports: PortStateSnapshot,
}

/// Register `set_port_preference` (single response) and
/// `subscribe_port_state` (a long-lived subscription that ends when the
/// client closes its followup stream).
pub fn register_port_manager_calls(api: &JsonApi, port_manager: Arc<PortManager>) {
    api.register_type::<SetPortPreferenceRequest>("set_port_preference");
    api.register_type::<SubscribePortStateRequest>("subscribe_port_state");
    api.register_type::<PortStateUpdate>("port_state_update");

    {
        let port_manager = port_manager.clone();
        api.register_call(
            "set_port_preference",
            move |req: SetPortPreferenceRequest, sink: ResponseSink, _followups: FollowupSource| {
                let port_manager = port_manager.clone();
                async move {
                    port_manager.set_port_preference(
                        &req.port_name,
                        PortPreference {
                            auto_connect: req.auto_connect,
                            should_be_connected: req.should_be_connected,
                        },
                    );
                    sink.send(Success {
                        message: format!("preference updated for {}", req.port_name),
                    })
                    .await;
                }
            },
        );
    }

    api.register_call(
        "subscribe_port_state",
        move |_req: SubscribePortStateRequest, sink: ResponseSink, mut followups: FollowupSource| {
            let port_manager = port_manager.clone();
            async move {
                let mut updates = port_manager.subscribe();
                loop {
                    tokio::select! {
                        // The transport closes the followup stream to cancel; any
                        // decoded followup (there are none expected) also exits.
                        _ = followups.recv::<()>() => return,
                        update = updates.recv() => {
                            match update {
                                Some(ports) => sink.send(PortStateUpdate { ports }).await,
                                None => return,
                            }
                        }
                    }
                }
            }
        },
    );
}

#[derive(Debug, Serialize, Deserialize)]
struct SendSimCommandRequest {
    command: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubscribeLiveDataRequest {}

/// Register `send_sim_command` (fire-and-forget) and `subscribe_live_data`
/// (a `Binary`-response subscription streaming encoded packets).
pub fn register_dispatcher_calls(api: &JsonApi, dispatcher: Arc<Dispatcher>, api_commands: tokio::sync::mpsc::Sender<ApiCommand>) {
    api.register_type::<SendSimCommandRequest>("send_sim_command");
    api.register_type::<SubscribeLiveDataRequest>("subscribe_live_data");

    api.register_call(
        "send_sim_command",
        move |req: SendSimCommandRequest, sink: ResponseSink, _followups: FollowupSource| {
            let api_commands = api_commands.clone();
            async move {
                let sent = api_commands
                    .send(ApiCommand {
                        bytes: req.command.into_bytes(),
                    })
                    .await
                    .is_ok();
                if sent {
                    sink.send(Success {
                        message: "command queued".to_string(),
                    })
                    .await;
                } else {
                    sink.send(Error {
                        message: "dispatcher unavailable".to_string(),
                    })
                    .await;
                }
            }
        },
    );

    api.register_call(
        "subscribe_live_data",
        move |_req: SubscribeLiveDataRequest, sink: ResponseSink, mut followups: FollowupSource| {
            let dispatcher = dispatcher.clone();
            async move {
                let mut packets = dispatcher.subscribe_live_data();
                loop {
                    tokio::select! {
                        _ = followups.recv::<()>() => return,
                        packet = packets.recv() => {
                            match packet {
                                Ok(bytes) => sink.send_binary(bytes).await,
                                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            }
                        }
                    }
                }
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonapi::{ApiResponse, JsonApi};

    fn control_reference_with_test_module(label: &str) -> (Arc<ControlReferenceStore>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("jsonapi-calls-test-{label}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("TestJet.json");
        std::fs::write(
            &path,
            r#"{
                "switches": {
                    "MASTER_ARM": {
                        "description": "master arm switch",
                        "outputs": [
                            {"address": 10, "mask": 3, "shift_by": 0, "max_value": 2, "type": "integer"}
                        ]
                    },
                    "CALLSIGN": {
                        "description": "radio callsign",
                        "outputs": [
                            {"address": 20, "max_length": 6, "type": "string"}
                        ]
                    }
                }
            }"#,
        )
        .unwrap();
        let control_reference = Arc::new(ControlReferenceStore::new());
        control_reference.load_file(&path).unwrap();
        (control_reference, dir)
    }

    #[tokio::test]
    async fn integer_control_round_trips_through_the_api() {
        let (control_reference, dir) = control_reference_with_test_module("integer");
        let store = Arc::new(ShadowStore::with_control_reference(control_reference.clone()));

        let api = JsonApi::new();
        register_control_value_calls(&api, store, control_reference);

        let set = serde_json::json!({"datatype": "set_control_value", "data": {"id": "TestJet/MASTER_ARM", "integer": 2}});
        let (mut rx, _followups) = api.handle_call(set.to_string().as_bytes()).unwrap();
        match rx.recv().await.expect("response") {
            ApiResponse::Json(v) => assert_eq!(v["datatype"], "success"),
            ApiResponse::Binary(_) => panic!("expected json response"),
        }

        let get = serde_json::json!({"datatype": "get_control_value", "data": {"id": "TestJet/MASTER_ARM"}});
        let (mut rx, _followups) = api.handle_call(get.to_string().as_bytes()).unwrap();
        match rx.recv().await.expect("response") {
            ApiResponse::Json(v) => {
                assert_eq!(v["datatype"], "control_value");
                assert_eq!(v["data"]["integer"], 2);
                assert!(v["data"]["string"].is_null());
            }
            ApiResponse::Binary(_) => panic!("expected json response"),
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn unknown_control_returns_error() {
        let (control_reference, dir) = control_reference_with_test_module("unknown");
        let store = Arc::new(ShadowStore::with_control_reference(control_reference.clone()));

        let api = JsonApi::new();
        register_control_value_calls(&api, store, control_reference);

        let set = serde_json::json!({"datatype": "set_control_value", "data": {"id": "TestJet/NOT_A_CONTROL", "integer": 1}});
        let (mut rx, _followups) = api.handle_call(set.to_string().as_bytes()).unwrap();
        match rx.recv().await.expect("response") {
            ApiResponse::Json(v) => assert_eq!(v["datatype"], "error"),
            ApiResponse::Binary(_) => panic!("expected json response"),
        }

        std::fs::remove_dir_all(&dir).ok();
    }
}

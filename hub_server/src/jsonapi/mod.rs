//! Asymmetric request/response/followup bus: every message on the wire is
//! an envelope `{datatype, data}`. A string-keyed registry of decode/encode
//! closures plus a handler map; each handler spawns as its own task that
//! owns a response sink and a followup source.

pub mod calls;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Protocol-level failures the multiplexer itself can raise, independent
/// of any particular handler's own logic.
#[derive(Debug, Error)]
pub enum JsonApiError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),
    #[error("unknown msgtype: {0}")]
    UnknownType(String),
    #[error("no handler registered for msgtype: {0}")]
    NoHandler(String),
}

/// One value a handler can emit on its response sink.
pub enum HandlerOutput {
    /// Encoded with the registered schema for its concrete type.
    Typed(Box<dyn Any + Send>),
    /// Bypasses JSON encoding entirely; delivered as raw bytes.
    Binary(Vec<u8>),
}

/// What a transport delivers to a client for one emitted response.
#[derive(Debug, Clone)]
pub enum ApiResponse {
    Json(Value),
    Binary(Vec<u8>),
}

type DecodeFn = Arc<dyn Fn(Value) -> anyhow::Result<Box<dyn Any + Send>> + Send + Sync>;
type EncodeFn = Arc<dyn Fn(&(dyn Any + Send)) -> anyhow::Result<Value> + Send + Sync>;
type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type HandlerFn = Arc<dyn Fn(Box<dyn Any + Send>, ResponseSink, FollowupSource) -> BoxFuture + Send + Sync>;

/// Handed to a spawned handler to emit zero, one, or many responses.
/// Dropping it (or calling nothing further) closes the response stream.
#[derive(Clone)]
pub struct ResponseSink {
    tx: mpsc::Sender<HandlerOutput>,
}

impl ResponseSink {
    pub async fn send<T: Send + 'static>(&self, value: T) {
        let _ = self.tx.send(HandlerOutput::Typed(Box::new(value))).await;
    }

    pub async fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(HandlerOutput::Binary(bytes)).await;
    }
}

/// Handed to a spawned handler to receive zero or more decoded followup
/// messages. Returns `None` once the transport closes the followup stream
/// (client cancellation); well-behaved handlers observe that and stop.
pub struct FollowupSource {
    rx: mpsc::Receiver<Box<dyn Any + Send>>,
}

impl FollowupSource {
    pub async fn recv<T: 'static>(&mut self) -> Option<T> {
        loop {
            let boxed = self.rx.recv().await?;
            match boxed.downcast::<T>() {
                Ok(value) => return Some(*value),
                Err(_) => continue, // followup of a type this handler doesn't expect; drop it.
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    decoders: HashMap<String, DecodeFn>,
    encoders: HashMap<TypeId, (String, EncodeFn)>,
    handlers: HashMap<String, HandlerFn>,
}

/// The JSON-API multiplexer. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct JsonApi {
    registry: Arc<Mutex<Registry>>,
}

#[derive(serde::Deserialize)]
struct Envelope {
    datatype: String,
    data: Value,
}

#[derive(serde::Serialize)]
struct OutEnvelope<'a> {
    datatype: &'a str,
    data: Value,
}

impl JsonApi {
    pub fn new() -> Self {
        let api = Self {
            registry: Arc::new(Mutex::new(Registry::default())),
        };
        calls::register_standard_types(&api);
        api
    }

    /// Associate `name` with a concrete decodable/encodable shape.
    pub fn register_type<T>(&self, name: &str)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let mut reg = self.registry.lock().expect("jsonapi registry lock poisoned");
        let owned_name = name.to_string();
        reg.decoders.insert(
            name.to_string(),
            Arc::new(move |value: Value| -> anyhow::Result<Box<dyn Any + Send>> {
                let parsed: T = serde_json::from_value(value)?;
                Ok(Box::new(parsed))
            }),
        );
        reg.encoders.insert(
            TypeId::of::<T>(),
            (
                owned_name,
                Arc::new(|value: &(dyn Any + Send)| -> anyhow::Result<Value> {
                    let typed = value
                        .downcast_ref::<T>()
                        .expect("encoder registered against the wrong TypeId");
                    Ok(serde_json::to_value(typed)?)
                }),
            ),
        );
    }

    /// Associate `name` with a handler that runs in its own task per call.
    pub fn register_call<T, F, Fut>(&self, name: &str, handler: F)
    where
        T: Send + 'static,
        F: Fn(T, ResponseSink, FollowupSource) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: HandlerFn = Arc::new(move |boxed, sink, followups| {
            let handler = handler.clone();
            Box::pin(async move {
                match boxed.downcast::<T>() {
                    Ok(value) => handler(*value, sink, followups).await,
                    Err(_) => log::error!("jsonapi: initial message type mismatch for handler"),
                }
            })
        });
        self.registry
            .lock()
            .expect("jsonapi registry lock poisoned")
            .handlers
            .insert(name.to_string(), wrapped);
    }

    /// Decode `envelope_json`, spawn the matching handler, and return a
    /// channel of encoded responses plus the sink that forwards decoded
    /// followup messages to the handler.
    pub fn handle_call(
        &self,
        envelope_json: &[u8],
    ) -> anyhow::Result<(mpsc::Receiver<ApiResponse>, FollowupSink)> {
        let envelope: Envelope = serde_json::from_slice(envelope_json).map_err(JsonApiError::InvalidEnvelope)?;

        let (decode, handler) = {
            let reg = self.registry.lock().expect("jsonapi registry lock poisoned");
            let decode = reg
                .decoders
                .get(&envelope.datatype)
                .cloned()
                .ok_or_else(|| JsonApiError::UnknownType(envelope.datatype.clone()))?;
            let handler = reg
                .handlers
                .get(&envelope.datatype)
                .cloned()
                .ok_or_else(|| JsonApiError::NoHandler(envelope.datatype.clone()))?;
            (decode, handler)
        };

        let initial = decode(envelope.data)?;

        let (out_tx, out_rx) = mpsc::channel::<HandlerOutput>(16);
        let (followup_tx, followup_rx) = mpsc::channel::<Box<dyn Any + Send>>(16);

        let sink = ResponseSink { tx: out_tx };
        let followups = FollowupSource { rx: followup_rx };
        tokio::spawn(handler(initial, sink, followups));

        let (response_tx, response_rx) = mpsc::channel::<ApiResponse>(16);
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut out_rx = out_rx;
            while let Some(output) = out_rx.recv().await {
                let response = match output {
                    HandlerOutput::Binary(bytes) => ApiResponse::Binary(bytes),
                    HandlerOutput::Typed(value) => {
                        let encoded = {
                            let reg = registry.lock().expect("jsonapi registry lock poisoned");
                            reg.encoders.get(&(*value).type_id()).cloned()
                        };
                        match encoded {
                            Some((datatype, encode)) => match encode(value.as_ref()) {
                                Ok(data) => match serde_json::to_value(OutEnvelope { datatype: &datatype, data }) {
                                    Ok(v) => ApiResponse::Json(v),
                                    Err(e) => {
                                        log::error!("jsonapi: failed to serialize envelope: {e}");
                                        continue;
                                    }
                                },
                                Err(e) => {
                                    log::error!("jsonapi: failed to encode response: {e}");
                                    continue;
                                }
                            },
                            None => {
                                log::error!("jsonapi: no registered encoder for response type");
                                continue;
                            }
                        }
                    }
                };
                if response_tx.send(response).await.is_err() {
                    break;
                }
            }
        });

        Ok((
            response_rx,
            FollowupSink {
                decode_fn: self.clone(),
                tx: followup_tx,
            },
        ))
    }
}

impl Default for JsonApi {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivers raw followup envelopes from the transport into the running
/// handler. Dropping it (transport closing the followup stream) signals
/// cancellation to the handler.
pub struct FollowupSink {
    decode_fn: JsonApi,
    tx: mpsc::Sender<Box<dyn Any + Send>>,
}

impl FollowupSink {
    pub async fn deliver(&self, followup_json: &[u8]) {
        let envelope: Envelope = match serde_json::from_slice(followup_json) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("jsonapi: could not decode followup message: {e}");
                return;
            }
        };
        let decode = {
            let reg = self.decode_fn.registry.lock().expect("jsonapi registry lock poisoned");
            reg.decoders.get(&envelope.datatype).cloned()
        };
        let Some(decode) = decode else {
            log::warn!("jsonapi: unknown followup msgtype: {}", envelope.datatype);
            return;
        };
        match decode(envelope.data) {
            Ok(value) => {
                let _ = self.tx.send(value).await;
            }
            Err(e) => log::warn!("jsonapi: could not decode followup message: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping {
        nonce: u32,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Pong {
        nonce: u32,
    }

    #[tokio::test]
    async fn single_response_round_trip() {
        let api = JsonApi::new();
        api.register_type::<Ping>("ping");
        api.register_type::<Pong>("pong");
        api.register_call("ping", |req: Ping, sink: ResponseSink, _followups: FollowupSource| async move {
            sink.send(Pong { nonce: req.nonce }).await;
        });

        let envelope = serde_json::json!({"datatype": "ping", "data": {"nonce": 7}});
        let (mut rx, _followups) = api.handle_call(envelope.to_string().as_bytes()).unwrap();

        let response = rx.recv().await.expect("response");
        match response {
            ApiResponse::Json(value) => {
                assert_eq!(value["datatype"], "pong");
                assert_eq!(value["data"]["nonce"], 7);
            }
            ApiResponse::Binary(_) => panic!("expected json response"),
        }
        assert!(rx.recv().await.is_none(), "handler should close the response stream");
    }

    #[tokio::test]
    async fn dropping_the_followup_sink_ends_a_subscription_handler() {
        let api = JsonApi::new();
        api.register_type::<Ping>("ping");
        api.register_type::<Pong>("pong");
        api.register_call("ping", |req: Ping, sink: ResponseSink, mut followups: FollowupSource| async move {
            let mut count = req.nonce;
            loop {
                tokio::select! {
                    _ = followups.recv::<()>() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(5)) => {
                        count += 1;
                        sink.send(Pong { nonce: count }).await;
                    }
                }
            }
        });

        let envelope = serde_json::json!({"datatype": "ping", "data": {"nonce": 0}});
        let (mut rx, followup_sink) = api.handle_call(envelope.to_string().as_bytes()).unwrap();

        // Let the handler emit at least one tick before cancelling.
        rx.recv().await.expect("at least one response before cancellation");
        drop(followup_sink);

        // Once the followup stream closes, the handler returns and the
        // response channel drains to closed.
        while rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn unknown_datatype_errors() {
        let api = JsonApi::new();
        let envelope = serde_json::json!({"datatype": "nonexistent", "data": {}});
        assert!(api.handle_call(envelope.to_string().as_bytes()).is_err());
    }

    #[tokio::test]
    async fn followups_are_forwarded_to_handler() {
        let api = JsonApi::new();
        api.register_type::<Ping>("ping");
        api.register_type::<Pong>("pong");
        api.register_call("ping", |_req: Ping, sink: ResponseSink, mut followups: FollowupSource| async move {
            if let Some(followup) = followups.recv::<Ping>().await {
                sink.send(Pong { nonce: followup.nonce }).await;
            }
        });

        let envelope = serde_json::json!({"datatype": "ping", "data": {"nonce": 1}});
        let (mut rx, followup_sink) = api.handle_call(envelope.to_string().as_bytes()).unwrap();

        let followup = serde_json::json!({"datatype": "ping", "data": {"nonce": 99}});
        followup_sink.deliver(followup.to_string().as_bytes()).await;

        let response = rx.recv().await.expect("response");
        match response {
            ApiResponse::Json(value) => assert_eq!(value["data"]["nonce"], 99),
            ApiResponse::Binary(_) => panic!("expected json response"),
        }
    }
}

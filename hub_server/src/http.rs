//! The local HTTP/WebSocket edge: an axum router carrying JSON-API
//! envelopes over a single-shot POST and over a long-lived WebSocket, plus
//! static app serving with a path-traversal guard gated by
//! [`AppContext::external_network_access`].

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ws::Message, ws::WebSocket, ConnectInfo, Path as AxumPath, State, WebSocketUpgrade},
    http::{header, Response, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::context::AppContext;
use crate::jsonapi::{ApiResponse, JsonApi};

#[derive(Clone)]
struct HttpState {
    api: JsonApi,
    context: AppContext,
    app_dir: PathBuf,
}

/// Runs the HTTP edge until `shutdown` fires. Returns `Err` if the listener
/// could never be bound, so `main` can treat a port conflict as fatal
/// instead of leaving the process running with no HTTP edge at all.
pub async fn run(http_port: u16, app_dir: PathBuf, api: JsonApi, context: AppContext, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let state = HttpState { api, context, app_dir };
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/", get(root_redirect))
        .route("/app/{appname}/{*path}", get(serve_app_file))
        .route("/api/postjson", post(post_json))
        .route("/api/websocket", get(ws_upgrade))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("could not bind http listener on {addr}: {e}"))?;
    log::info!("http edge listening on {addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("http edge shutting down");
        })
        .await
        .ok();
    Ok(())
}

/// `axum::response::Redirect` only hands out 303/307/308; the hub config
/// app expects a plain 302 here, so the response is built by hand.
async fn root_redirect() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, "/app/hubconfig")])
}

fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

/// Rejects any path component that would escape `root` (`..`, absolute
/// roots, prefixes). Returns the joined, still-unchecked-for-existence path.
fn safe_join(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut joined = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(joined)
}

async fn serve_app_file(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    AxumPath((appname, path)): AxumPath<(String, String)>,
) -> impl IntoResponse {
    if !is_loopback(&peer) && !state.context.external_network_access() {
        return StatusCode::FORBIDDEN.into_response();
    }

    let app_root = state.app_dir.join(&appname);
    let Some(full_path) = safe_join(&app_root, &path) else {
        return StatusCode::FORBIDDEN.into_response();
    };

    match tokio::fs::read(&full_path).await {
        Ok(bytes) => {
            let mime = mime_guess_from_extension(&full_path);
            Response::builder()
                .status(StatusCode::OK)
                .header(axum::http::header::CONTENT_TYPE, mime)
                .body(axum::body::Body::from(bytes))
                .unwrap()
                .into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn mime_guess_from_extension(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// `POST /api/postjson`: single-shot call. Preserves the documented
/// single-response contract (any further responses are dropped).
async fn post_json(State(state): State<HttpState>, body: Bytes) -> impl IntoResponse {
    match state.api.handle_call(&body) {
        Ok((mut responses, _followups)) => match responses.recv().await {
            Some(ApiResponse::Json(value)) => axum::Json(value).into_response(),
            Some(ApiResponse::Binary(bytes)) => bytes.into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn ws_upgrade(State(state): State<HttpState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state.api))
}

async fn handle_websocket(mut socket: WebSocket, api: JsonApi) {
    let Some(Ok(Message::Text(initial))) = socket.recv().await else {
        return;
    };

    let (mut responses, followups) = match api.handle_call(initial.as_bytes()) {
        Ok(pair) => pair,
        Err(e) => {
            let _ = socket.send(Message::Text(format!("{{\"datatype\":\"error\",\"data\":{{\"message\":\"{e}\"}}}}").into())).await;
            return;
        }
    };

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => followups.deliver(text.as_bytes()).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            response = responses.recv() => {
                match response {
                    Some(ApiResponse::Json(value)) => {
                        let Ok(text) = serde_json::to_string(&value) else { continue };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(ApiResponse::Binary(bytes)) => {
                        if socket.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_parent_traversal() {
        let root = Path::new("/srv/app");
        assert!(safe_join(root, "../../etc/passwd").is_none());
    }

    #[test]
    fn safe_join_accepts_nested_path() {
        let root = Path::new("/srv/app");
        assert_eq!(safe_join(root, "css/style.css"), Some(PathBuf::from("/srv/app/css/style.css")));
    }
}

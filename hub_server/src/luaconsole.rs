//! An alternative JSON-API transport tunneled over one TCP connection
//! instead of HTTP/WebSocket. One envelope per line; the first line is the
//! initial call, every line after is a followup, and responses are written
//! back one line at a time.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::jsonapi::{ApiResponse, JsonApi};

pub async fn run(port: u16, api: JsonApi, mut shutdown: broadcast::Receiver<()>) {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("could not bind lua console listener on {addr}: {e}");
            return;
        }
    };
    log::info!("lua console listening on {addr}");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("lua console shutting down");
                return;
            }
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                log::debug!("lua console connection from {peer}");
                tokio::spawn(handle_connection(stream, api.clone()));
            }
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, api: JsonApi) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Ok(Some(initial)) = lines.next_line().await else {
        return;
    };

    let (mut responses, followups) = match api.handle_call(initial.as_bytes()) {
        Ok(pair) => pair,
        Err(e) => {
            let _ = write_half.write_all(format!("{{\"datatype\":\"error\",\"data\":{{\"message\":\"{e}\"}}}}\n").as_bytes()).await;
            return;
        }
    };

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => followups.deliver(text.as_bytes()).await,
                    _ => break,
                }
            }
            response = responses.recv() => {
                let encoded = match response {
                    Some(ApiResponse::Json(value)) => match serde_json::to_string(&value) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(ApiResponse::Binary(_)) => {
                        log::warn!("lua console: binary response has no line-oriented encoding, dropped");
                        continue;
                    }
                    None => break,
                };
                if write_half.write_all(encoded.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        }
    }
}

//! Single outbound TCP connection to the simulator's export stream: a
//! `Connecting <-> Connected` state machine with a fire-and-forget
//! `try_send` contract and a `tokio::select!`-driven reconnect loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

const REDIAL_DELAY: Duration = Duration::from_secs(1);
const READ_CHUNK_SIZE: usize = 4096;

/// Handle for submitting outbound command bytes to the simulator link.
///
/// Writes are at-most-once: if the link is not currently `Connected`, the
/// bytes are silently discarded, matching the simulator's own fire-and-forget
/// input contract.
#[derive(Clone)]
pub struct SimLinkHandle {
    write_tx: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl SimLinkHandle {
    /// Fire-and-forget: queue `bytes` for the writer task if connected.
    /// Returns immediately; never blocks the caller on socket I/O.
    pub fn try_send(&self, bytes: Vec<u8>) {
        if self.connected.load(Ordering::Relaxed) {
            let _ = self.write_tx.try_send(bytes);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Run the simulator link until `shutdown` fires. `on_bytes` is called with
/// each chunk read from the socket (typically feeding a `FrameParser`).
pub async fn run(
    host: String,
    port: u16,
    on_bytes: impl Fn(&[u8]) + Send + Sync + 'static,
    mut shutdown: broadcast::Receiver<()>,
) -> SimLinkHandle {
    let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
    let connected = Arc::new(AtomicBool::new(false));
    let handle = SimLinkHandle {
        write_tx,
        connected: connected.clone(),
    };

    tokio::spawn(run_loop(host, port, on_bytes, connected, write_rx, shutdown.resubscribe()));

    handle
}

async fn run_loop(
    host: String,
    port: u16,
    on_bytes: impl Fn(&[u8]) + Send + Sync + 'static,
    connected: Arc<AtomicBool>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let stream = loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("sim link shutting down before connect");
                    return;
                }
                result = TcpStream::connect((host.as_str(), port)) => {
                    match result {
                        Ok(stream) => break stream,
                        Err(e) => {
                            log::warn!("sim link connect to {host}:{port} failed: {e}");
                            tokio::time::sleep(REDIAL_DELAY).await;
                        }
                    }
                }
            }
        };

        log::info!("sim link connected to {host}:{port}");
        connected.store(true, Ordering::Relaxed);
        let (mut read_half, mut write_half) = stream.into_split();

        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("sim link shutting down");
                    connected.store(false, Ordering::Relaxed);
                    return;
                }
                Some(bytes) = write_rx.recv() => {
                    if let Err(e) = write_half.write_all(&bytes).await {
                        log::warn!("sim link write failed: {e}");
                        connected.store(false, Ordering::Relaxed);
                        break;
                    }
                }
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            log::info!("sim link closed by peer");
                            connected.store(false, Ordering::Relaxed);
                            break;
                        }
                        Ok(n) => on_bytes(&buf[..n]),
                        Err(e) => {
                            log::warn!("sim link read failed: {e}");
                            connected.store(false, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn delivers_bytes_and_allows_outbound_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = run(
            addr.ip().to_string(),
            addr.port(),
            move |bytes| received_clone.lock().unwrap().extend_from_slice(bytes),
            shutdown_rx,
        )
        .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_connected());
        handle.try_send(b"world".to_vec());

        let echoed = tokio::time::timeout(Duration::from_secs(2), accept_task).await.unwrap().unwrap();
        assert_eq!(echoed, b"world");
        assert_eq!(&received.lock().unwrap()[..], b"hello");

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn try_send_while_disconnected_is_a_noop() {
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = run("127.0.0.1".to_string(), 1, |_| {}, shutdown_rx).await;
        // port 1 is not listening; connection never establishes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_connected());
        handle.try_send(b"ignored".to_vec()); // must not panic
    }
}

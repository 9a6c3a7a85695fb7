//! One serial panel connection: owns the blocking `serialport` handle on a
//! dedicated OS thread and exposes an async-friendly line-reader channel
//! plus fire-and-forget writes. State progresses one-way through
//! `{Connecting, Open, Closed}`; reads are newline-delimited, writes are
//! silently discarded unless `Open`.

use std::io::Read;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

const BAUD_RATE: u32 = 250_000;
const READ_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl From<u8> for ConnState {
    fn from(v: u8) -> Self {
        match v {
            1 => ConnState::Open,
            2 => ConnState::Closed,
            _ => ConnState::Connecting,
        }
    }
}

/// A line read from a connected panel, tagged with the port it came from.
#[derive(Debug, Clone)]
pub struct InputCommand {
    pub source_port: String,
    pub bytes: Vec<u8>,
}

/// Handle to one serial connection. Cloning shares the same underlying port.
#[derive(Clone)]
pub struct SerialConn {
    port_name: String,
    state: Arc<AtomicU8>,
    write_tx: std::sync::mpsc::Sender<Vec<u8>>,
}

impl std::fmt::Debug for SerialConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialConn")
            .field("port_name", &self.port_name)
            .field("state", &self.state())
            .finish()
    }
}

impl SerialConn {
    /// Open `port_name` at 250000 8-N-1 on a dedicated blocking thread.
    /// Returns immediately in `Connecting`; `inbound` receives one
    /// [`InputCommand`] per newline-delimited line read from the port.
    pub fn open(port_name: String, inbound: mpsc::Sender<InputCommand>) -> Self {
        let state = Arc::new(AtomicU8::new(ConnState::Connecting as u8));
        let (write_tx, write_rx) = std::sync::mpsc::channel::<Vec<u8>>();

        let conn = Self {
            port_name: port_name.clone(),
            state: state.clone(),
            write_tx,
        };

        std::thread::spawn(move || run_blocking(port_name, state, write_rx, inbound));

        conn
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::Relaxed))
    }

    /// Write `data` if the port is currently `Open`; otherwise a no-op.
    /// Never blocks the caller on serial I/O.
    pub fn write(&self, data: Vec<u8>) {
        if self.state() == ConnState::Open {
            let _ = self.write_tx.send(data);
        }
    }

    /// Request the connection close. Idempotent; takes effect on the next
    /// pass of the blocking read/write loop.
    pub fn close(&self) {
        self.state.store(ConnState::Closed as u8, Ordering::Relaxed);
    }
}

fn run_blocking(
    port_name: String,
    state: Arc<AtomicU8>,
    write_rx: std::sync::mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<InputCommand>,
) {
    let mut port = match serialport::new(&port_name, BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(READ_TIMEOUT)
        .open()
    {
        Ok(port) => port,
        Err(e) => {
            log::warn!("failed to open serial port {port_name}: {e}");
            state.store(ConnState::Closed as u8, Ordering::Relaxed);
            return;
        }
    };

    state.store(ConnState::Open as u8, Ordering::Relaxed);

    let mut line_buf: Vec<u8> = Vec::new();
    let mut read_buf = [0u8; 256];

    loop {
        if state.load(Ordering::Relaxed) == ConnState::Closed as u8 {
            break;
        }

        while let Ok(bytes) = write_rx.try_recv() {
            if let Err(e) = std::io::Write::write_all(&mut port, &bytes) {
                log::warn!("serial write to {port_name} failed: {e}");
            }
        }

        match port.read(&mut read_buf) {
            Ok(0) => {}
            Ok(n) => {
                for &b in &read_buf[..n] {
                    if b == b'\n' {
                        let line = std::mem::take(&mut line_buf);
                        let _ = inbound.blocking_send(InputCommand {
                            source_port: port_name.clone(),
                            bytes: line,
                        });
                    } else if b != b'\r' {
                        line_buf.push(b);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::info!("serial read from {port_name} ended: {e}");
                break;
            }
        }
    }

    state.store(ConnState::Closed as u8, Ordering::Relaxed);
}

//! The single data-plane scheduler: multiplexes API-client commands, serial
//! panel commands, simulator frames, and a 60 ms ticker into one encode/write
//! cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};

use hub_common::shadow::Frame;
use hub_common::Encoder;

use crate::portmanager::{InputCommand, PortManager};
use crate::scripting::{self, InputFilter, OutputMutator};
use crate::simlink::SimLinkHandle;

const FORCE_ENCODE_PERIOD: Duration = Duration::from_millis(60);

/// A command from a local API client, destined for the simulator link.
#[derive(Debug, Clone)]
pub struct ApiCommand {
    pub bytes: Vec<u8>,
}

/// Multiplexes the four data-plane event sources into encode/write cycles.
pub struct Dispatcher {
    encoder: Mutex<Encoder>,
    sim_link: SimLinkHandle,
    port_manager: Arc<PortManager>,
    live_data_tx: broadcast::Sender<Vec<u8>>,
    input_filters: Vec<Box<dyn InputFilter>>,
    output_mutators: Vec<Box<dyn OutputMutator>>,
}

impl Dispatcher {
    pub fn new(sim_link: SimLinkHandle, port_manager: Arc<PortManager>) -> Self {
        let (live_data_tx, _) = broadcast::channel(64);
        Self {
            encoder: Mutex::new(Encoder::new()),
            sim_link,
            port_manager,
            live_data_tx,
            input_filters: Vec::new(),
            output_mutators: Vec::new(),
        }
    }

    pub fn with_input_filters(mut self, filters: Vec<Box<dyn InputFilter>>) -> Self {
        self.input_filters = filters;
        self
    }

    pub fn with_output_mutators(mut self, mutators: Vec<Box<dyn OutputMutator>>) -> Self {
        self.output_mutators = mutators;
        self
    }

    /// Subscribe to the encoded-packet broadcast used by `LiveData` API clients.
    pub fn subscribe_live_data(&self) -> broadcast::Receiver<Vec<u8>> {
        self.live_data_tx.subscribe()
    }

    /// Run the event loop until `shutdown` fires.
    pub async fn run(
        &self,
        mut api_commands: mpsc::Receiver<ApiCommand>,
        mut serial_commands: mpsc::Receiver<InputCommand>,
        mut frames: watch::Receiver<Option<Frame>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(FORCE_ENCODE_PERIOD);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("dispatcher shutting down");
                    return;
                }
                Some(cmd) = api_commands.recv() => {
                    self.dispatch_input_command(&cmd.bytes).await;
                }
                Some(cmd) = serial_commands.recv() => {
                    log::debug!("[{}] {}", cmd.source_port, String::from_utf8_lossy(&cmd.bytes));
                    self.dispatch_input_command(&cmd.bytes).await;
                }
                changed = frames.changed() => {
                    if changed.is_ok() {
                        let frame = frames.borrow_and_update().clone();
                        if let Some(frame) = frame {
                            self.handle_frame(&frame).await;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.run_encode_cycle().await;
                }
            }
        }
    }

    async fn dispatch_input_command(&self, bytes: &[u8]) {
        let Some(filtered) = scripting::apply_input_filters(&self.input_filters, bytes) else {
            return;
        };
        let mut payload = filtered;
        payload.push(b'\n');
        self.sim_link.try_send(payload);
    }

    async fn handle_frame(&self, frame: &Frame) {
        {
            let mut encoder = self.encoder.lock().await;
            encoder.update_from_frame(frame);
        }
        self.run_encode_cycle().await;
    }

    async fn run_encode_cycle(&self) {
        let packet = {
            let mut encoder = self.encoder.lock().await;
            scripting::apply_output_mutators(&self.output_mutators, &mut encoder);
            encoder.encode()
        };

        if packet.is_empty() {
            return;
        }

        self.port_manager.write(&packet);
        let _ = self.live_data_tx.send(packet);
    }
}

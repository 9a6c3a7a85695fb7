//! The Mealy-machine byte parser that turns a simulator's export TCP stream
//! into [`crate::shadow::ShadowStore`] writes and frame notifications.
//!
//! The remaining-word counter decrements once per word pair, since `LEN`
//! counts bytes and a word is two bytes.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::shadow::{ShadowStore, END_OF_FRAME_ADDRESS};

/// Address that, when decoded, is treated as a spurious in-band sync rather
/// than a real record start.
const SPURIOUS_SYNC_ADDRESS: u16 = 0x0555;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForSync,
    AddressLow,
    AddressHigh,
    CountLow,
    CountHigh,
    DataLow,
    DataHigh,
}

struct StringWatcher {
    address: u16,
    length: u16,
    callback: Box<dyn Fn(&[u8]) + Send + Sync>,
}

/// Streaming byte-at-a-time parser. One parser owns one [`ShadowStore`] and
/// publishes a [`crate::shadow::Frame`] each time a frame completes.
pub struct FrameParser {
    state: State,
    sync_byte_count: u8,
    address: u16,
    remaining_words: u16,
    data_low: u8,
    store: Arc<ShadowStore>,
    frame_tx: watch::Sender<Option<crate::shadow::Frame>>,
    watchers: Mutex<Vec<StringWatcher>>,
}

impl FrameParser {
    /// Build a parser over `store`, returning it alongside the receiving end
    /// of its frame channel. The channel holds the latest frame only: a slow
    /// consumer observes only the most recent update, never a backlog.
    pub fn new(store: Arc<ShadowStore>) -> (Self, watch::Receiver<Option<crate::shadow::Frame>>) {
        let (frame_tx, frame_rx) = watch::channel(None);
        let parser = Self {
            state: State::WaitForSync,
            sync_byte_count: 0,
            address: 0,
            remaining_words: 0,
            data_low: 0,
            store,
            frame_tx,
            watchers: Mutex::new(Vec::new()),
        };
        (parser, frame_rx)
    }

    /// Register a string-buffer watcher: after each frame, the bytes
    /// `[address, address+length)` are copied from the shadow store,
    /// truncated at the first zero byte, and handed to `callback`.
    pub fn subscribe_string_buffer(&self, address: u16, length: u16, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.watchers.lock().expect("watcher lock poisoned").push(StringWatcher {
            address,
            length,
            callback: Box::new(callback),
        });
    }

    /// Feed a chunk of bytes read from the simulator socket.
    pub fn process_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.process_byte(b);
        }
    }

    /// Feed a single byte through the state machine.
    ///
    /// A run of four or more consecutive `0x55` bytes re-syncs regardless of
    /// the byte that run interrupts: the first four close out the run and
    /// park the state machine at `AddressLow`, and any further `0x55` bytes
    /// keep being swallowed as continued sync noise rather than consumed as
    /// the next address — only the first non-`0x55` byte after the run is
    /// real address data. This check has to happen before state dispatch,
    /// not after: dispatching first would let the byte that extends an
    /// already-closed run be fed to `AddressLow` as if it were data.
    pub fn process_byte(&mut self, b: u8) {
        if b == 0x55 {
            self.sync_byte_count = self.sync_byte_count.saturating_add(1);
            if self.sync_byte_count >= 4 {
                self.state = State::AddressLow;
                return;
            }
        } else {
            self.sync_byte_count = 0;
        }

        match self.state {
            State::WaitForSync => {}

            State::AddressLow => {
                self.address = b as u16;
                self.state = State::AddressHigh;
            }

            State::AddressHigh => {
                self.address |= (b as u16) << 8;
                if self.address == SPURIOUS_SYNC_ADDRESS {
                    self.state = State::WaitForSync;
                } else {
                    self.state = State::CountLow;
                }
            }

            State::CountLow => {
                self.remaining_words = b as u16;
                self.state = State::CountHigh;
            }

            State::CountHigh => {
                self.remaining_words |= (b as u16) << 8;
                // LEN is a byte count; a zero-length record is a valid no-op.
                if self.remaining_words == 0 {
                    self.state = State::AddressLow;
                } else {
                    self.state = State::DataLow;
                }
            }

            State::DataLow => {
                self.data_low = b;
                self.state = State::DataHigh;
            }

            State::DataHigh => {
                let word = ((b as u16) << 8) | self.data_low as u16;
                self.store.set_u16(self.address, word);

                if self.address == END_OF_FRAME_ADDRESS {
                    self.emit_frame();
                }

                self.address = self.address.wrapping_add(2);
                self.remaining_words = self.remaining_words.saturating_sub(2);

                self.state = if self.remaining_words == 0 {
                    State::AddressLow
                } else {
                    State::DataLow
                };
            }
        }
    }

    fn emit_frame(&mut self) {
        let frame = self.store.snapshot();
        self.store.clear_dirty_flags();

        for watcher in self.watchers.lock().expect("watcher lock poisoned").iter() {
            let mut bytes = Vec::with_capacity(watcher.length as usize);
            let mut addr = watcher.address;
            let end = watcher.address.wrapping_add(watcher.length);
            while addr != end {
                bytes.push((frame.get_u16(addr & !1) >> ((addr & 1) * 8)) as u8);
                addr = addr.wrapping_add(1);
            }
            let cut = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            (watcher.callback)(&bytes[..cut]);
        }

        let _ = self.frame_tx.send(Some(frame));
    }
}

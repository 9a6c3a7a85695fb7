//! The delta serializer: turns dirty words into a compact wire-format
//! update packet for the serial panel fan-out.
//!
//! The encoder owns its own dirty-tracked word buffer, distinct from the
//! `ShadowStore` the parser writes to; the Dispatcher copies each frame's
//! entries into it before calling [`Encoder::encode`].

use crate::shadow::{DataWord, Frame, END_OF_FRAME_ADDRESS};

/// Data word that collides with a sync byte pair if it appeared mid-record;
/// the coalescing pass refuses to span it.
const SYNC_COLLIDING_WORD: u16 = 0x5555;

/// Maximum address gap the coalescing pass will bridge by filling in
/// current (non-dirty) values rather than flushing a new record.
const MAX_COALESCE_GAP: u16 = 6;

/// Words retransmitted per [`Encoder::encode`] call regardless of dirtiness,
/// so a newly attached panel eventually observes the whole state.
const AUTOSYNC_WORDS_PER_TICK: usize = 5;

/// Delta encoder with its own dirty-tracked word buffer and a rolling
/// autosync cursor.
pub struct Encoder {
    words: Vec<DataWord>,
    autosync_index: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            words: Vec::new(),
            autosync_index: 0,
        }
    }

    /// Copy each `(address, data)` pair from `frame` into the encoder's
    /// buffer, marking an entry dirty only when its value actually changes
    /// (or is new).
    pub fn update_from_frame(&mut self, frame: &Frame) {
        for entry in frame.entries() {
            self.set(entry.address, entry.data);
        }
    }

    fn set(&mut self, address: u16, data: u16) {
        match self.words.binary_search_by_key(&address, |w| w.address) {
            Ok(idx) => {
                if self.words[idx].data != data {
                    self.words[idx].data = data;
                    self.words[idx].dirty = true;
                }
            }
            Err(idx) => self.words.insert(
                idx,
                DataWord {
                    address,
                    data,
                    dirty: true,
                },
            ),
        }
    }

    fn get(&self, address: u16) -> u16 {
        self.words
            .binary_search_by_key(&address, |w| w.address)
            .map(|idx| self.words[idx].data)
            .unwrap_or(0)
    }

    /// Produce one update packet: SYNC-prefixed, coalesced, dirty-only.
    /// Returns an empty vector if there is nothing to send.
    pub fn encode(&mut self) -> Vec<u8> {
        if !self.words.is_empty() {
            if let Some(entry) = self.words.iter_mut().find(|w| w.address == END_OF_FRAME_ADDRESS) {
                entry.dirty = true;
            }
        }

        if !self.words.is_empty() {
            let len = self.words.len();
            for _ in 0..AUTOSYNC_WORDS_PER_TICK {
                self.words[self.autosync_index].dirty = true;
                self.autosync_index = (self.autosync_index + 1) % len;
            }
        }

        let Some(first_dirty) = self.words.iter().position(|w| w.dirty) else {
            return Vec::new();
        };

        let mut packet = vec![0x55, 0x55, 0x55, 0x55];

        let mut write_start_address = self.words[first_dirty].address;
        let mut write_data = self.words[first_dirty].data.to_le_bytes().to_vec();
        let mut last_write_address = write_start_address;
        self.words[first_dirty].dirty = false;

        for i in (first_dirty + 1)..self.words.len() {
            if self.words[i].dirty {
                let address = self.words[i].address;
                let data = self.words[i].data;

                if address.wrapping_sub(last_write_address) <= MAX_COALESCE_GAP && data != SYNC_COLLIDING_WORD {
                    let mut a = last_write_address.wrapping_add(2);
                    while a <= address {
                        write_data.extend_from_slice(&self.get(a).to_le_bytes());
                        last_write_address = a;
                        a = a.wrapping_add(2);
                    }
                } else {
                    Self::flush_record(&mut packet, write_start_address, &write_data);
                    write_start_address = address;
                    write_data = data.to_le_bytes().to_vec();
                    last_write_address = address;
                }
            }
            self.words[i].dirty = false;
        }

        Self::flush_record(&mut packet, write_start_address, &write_data);
        packet
    }

    fn flush_record(packet: &mut Vec<u8>, address: u16, data: &[u8]) {
        packet.extend_from_slice(&address.to_le_bytes());
        packet.extend_from_slice(&(data.len() as u16).to_le_bytes());
        packet.extend_from_slice(data);
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_from(entries: &[(u16, u16)]) -> Frame {
        let store = crate::shadow::ShadowStore::new();
        for &(addr, data) in entries {
            store.set_u16(addr, data);
        }
        store.snapshot()
    }

    #[test]
    fn empty_buffer_produces_empty_packet() {
        let mut enc = Encoder::new();
        assert!(enc.encode().is_empty());
    }

    /// One dirty word plus the forced FFFE sentinel produces a
    /// SYNC-prefixed packet.
    #[test]
    fn single_dirty_word_produces_sync_prefixed_packet() {
        let mut enc = Encoder::new();
        enc.update_from_frame(&frame_from(&[(0x0000, 0xABCD)]));
        let packet = enc.encode();
        assert_eq!(&packet[0..4], &[0x55, 0x55, 0x55, 0x55]);
    }

    /// Adjacent dirty words within the coalescing gap merge into one record.
    #[test]
    fn adjacent_words_within_gap_coalesce() {
        let mut enc = Encoder::new();
        enc.update_from_frame(&frame_from(&[(0x0000, 0x1111), (0x0004, 0x2222)]));
        let packet = enc.encode();
        // SYNC(4) + ADDR(2) + LEN(2) + DATA(6: three words spanning 0,2,4) = 14
        assert_eq!(u16::from_le_bytes([packet[4], packet[5]]), 0x0000);
        let len = u16::from_le_bytes([packet[6], packet[7]]);
        assert_eq!(len, 6);
    }

    /// A gap larger than 6 starts a new record instead of coalescing.
    #[test]
    fn distant_words_start_new_record() {
        let mut enc = Encoder::new();
        enc.update_from_frame(&frame_from(&[(0x0000, 0x1111), (0x0100, 0x2222)]));
        let packet = enc.encode();
        // two separate records: ADDR/LEN/DATA(2) + ADDR/LEN/DATA(2)
        let first_len = u16::from_le_bytes([packet[6], packet[7]]);
        assert_eq!(first_len, 2);
        let second_addr_offset = 4 + 4 + first_len as usize;
        let second_addr = u16::from_le_bytes([packet[second_addr_offset], packet[second_addr_offset + 1]]);
        assert_eq!(second_addr, 0x0100);
    }

    #[test]
    fn dirty_flags_cleared_after_encode() {
        let mut enc = Encoder::new();
        enc.update_from_frame(&frame_from(&[(0x0000, 0x1111)]));
        enc.encode();
        assert!(enc.words.iter().all(|w| !w.dirty));
    }

    #[test]
    fn autosync_eventually_retransmits_clean_words() {
        let mut enc = Encoder::new();
        enc.update_from_frame(&frame_from(&[(0x0000, 1), (0x0002, 2), (0x0004, 3)]));
        enc.encode(); // clears all dirty flags, autosync cursor now at index 2 (wrapped)

        // next call: no new dirty data, but autosync should still produce a packet.
        let packet = enc.encode();
        assert!(!packet.is_empty());
    }

    #[test]
    fn encoded_packet_round_trips_through_the_parser() {
        let store = std::sync::Arc::new(crate::shadow::ShadowStore::new());
        store.set_u16(0x0000, 0xABCD);
        store.set_u16(0x0004, 0x1234);
        store.set_u16(END_OF_FRAME_ADDRESS, 2);
        let frame = store.snapshot();

        let mut enc = Encoder::new();
        enc.update_from_frame(&frame);
        let packet = enc.encode();
        assert!(!packet.is_empty());

        let decoded_store = std::sync::Arc::new(crate::shadow::ShadowStore::new());
        let (mut parser, _rx) = crate::parser::FrameParser::new(decoded_store.clone());
        parser.process_bytes(&packet);

        assert_eq!(decoded_store.get_u16(0x0000), 0xABCD);
        assert_eq!(decoded_store.get_u16(0x0004), 0x1234);
    }

    #[test]
    fn word_equal_to_sync_value_does_not_coalesce_across() {
        let mut enc = Encoder::new();
        enc.update_from_frame(&frame_from(&[(0x0000, 0x1111), (0x0002, 0x5555)]));
        let packet = enc.encode();
        let first_len = u16::from_le_bytes([packet[6], packet[7]]);
        assert_eq!(first_len, 2, "0x5555 word must start its own record, not extend the previous one");
    }
}

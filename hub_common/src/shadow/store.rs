//! The shadow memory image: a sorted, uniquely-keyed, dirty-tracked mapping
//! from 16-bit simulator address to 16-bit value.
//!
//! Mirrors `exportdataparser.DataBuffer` from the source project, but with
//! the bit twiddling for named controls split out into [`crate::controlref`].

use std::sync::{Arc, Mutex, MutexGuard};

use crate::controlref::{ControlReferenceStore, OutputKind};

/// End-of-frame sentinel address. A write here completes a [`Frame`].
pub const END_OF_FRAME_ADDRESS: u16 = 0xFFFE;

/// One address/value/dirty entry in the shadow memory image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataWord {
    /// Even 16-bit simulator address.
    pub address: u16,
    /// Current value at that address.
    pub data: u16,
    /// Set whenever `data` changes; cleared by the encoder or an explicit reset.
    pub dirty: bool,
}

/// An immutable snapshot of the shadow store at the moment the end-of-frame
/// sentinel was written.
///
/// Cheap to share: the entry vector is wrapped in an `Arc` so handing a
/// frame to N subscribers does not copy the data N times.
#[derive(Debug, Clone)]
pub struct Frame {
    entries: Arc<Vec<DataWord>>,
}

impl Frame {
    /// Entries in ascending address order, exactly as they stood at capture time.
    pub fn entries(&self) -> &[DataWord] {
        &self.entries
    }

    /// Value at `address`, or `0x0000` if the frame has no entry for it.
    pub fn get_u16(&self, address: u16) -> u16 {
        match self.entries.binary_search_by_key(&address, |w| w.address) {
            Ok(idx) => self.entries[idx].data,
            Err(_) => 0,
        }
    }
}

/// The 64 KiB addressable shadow memory image.
///
/// A single mutex serializes every operation; locking granularity is the
/// whole store. Callers needing exclusive access for a longer sequence of
/// writes (the `FrameParser` while consuming bytes) should take
/// [`ShadowStore::lock`] directly.
pub struct ShadowStore {
    inner: Mutex<Inner>,
    control_ref: Option<Arc<ControlReferenceStore>>,
}

struct Inner {
    // Sorted ascending by address, each address appearing at most once.
    words: Vec<DataWord>,
}

/// Exclusive access handle returned by [`ShadowStore::lock`].
pub struct ShadowStoreGuard<'a> {
    guard: MutexGuard<'a, Inner>,
    control_ref: Option<&'a Arc<ControlReferenceStore>>,
}

impl ShadowStore {
    /// Create an empty store with no control-reference catalog attached.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { words: Vec::new() }),
            control_ref: None,
        }
    }

    /// Create an empty store backed by a control-reference catalog, enabling
    /// the `*_by_control` operations.
    pub fn with_control_reference(control_ref: Arc<ControlReferenceStore>) -> Self {
        Self {
            inner: Mutex::new(Inner { words: Vec::new() }),
            control_ref: Some(control_ref),
        }
    }

    /// Acquire the exclusive lock for a sequence of operations.
    pub fn lock(&self) -> ShadowStoreGuard<'_> {
        ShadowStoreGuard {
            guard: self.inner.lock().expect("ShadowStore lock poisoned"),
            control_ref: self.control_ref.as_ref(),
        }
    }

    /// Upsert a 16-bit value. See [`ShadowStoreGuard::set_u16`].
    pub fn set_u16(&self, address: u16, value: u16) {
        self.lock().set_u16(address, value);
    }

    /// Read a 16-bit value, `0x0000` if absent.
    pub fn get_u16(&self, address: u16) -> u16 {
        self.lock().get_u16(address)
    }

    /// Take an immutable snapshot of the dirty + value pairs.
    pub fn snapshot(&self) -> Frame {
        self.lock().snapshot()
    }

    /// Clear all dirty flags.
    pub fn clear_dirty_flags(&self) {
        self.lock().clear_dirty_flags();
    }

    /// Discard all entries.
    pub fn reset(&self) {
        self.lock().reset();
    }
}

impl Default for ShadowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowStoreGuard<'_> {
    /// Upsert a 16-bit value, maintaining ascending address order.
    ///
    /// If an entry already holds the same value, `dirty` is left unchanged —
    /// writing the same value twice must not mark it dirty again.
    pub fn set_u16(&mut self, address: u16, value: u16) {
        let words = &mut self.guard.words;
        match words.binary_search_by_key(&address, |w| w.address) {
            Ok(idx) => {
                if words[idx].data != value {
                    words[idx].data = value;
                    words[idx].dirty = true;
                }
            }
            Err(idx) => words.insert(
                idx,
                DataWord {
                    address,
                    data: value,
                    dirty: true,
                },
            ),
        }
    }

    /// Read a 16-bit value, `0x0000` default-zero semantics if absent.
    pub fn get_u16(&self, address: u16) -> u16 {
        self.guard
            .words
            .binary_search_by_key(&address, |w| w.address)
            .map(|idx| self.guard.words[idx].data)
            .unwrap_or(0)
    }

    /// Byte-wise write, packed two bytes per word, low byte first. An odd
    /// trailing byte preserves the high byte of the final word.
    pub fn set_bytes(&mut self, address: u16, data: &[u8]) {
        let mut addr = address;
        let mut iter = data.chunks(2);
        while let Some(chunk) = iter.next() {
            let current = self.get_u16(addr);
            let word = if chunk.len() == 2 {
                u16::from_le_bytes([chunk[0], chunk[1]])
            } else {
                (current & 0xFF00) | chunk[0] as u16
            };
            self.set_u16(addr, word);
            addr = addr.wrapping_add(2);
        }
    }

    /// Resolve `module/name` and return its integer output value, or `-1` if
    /// the control or its integer output is unknown.
    pub fn get_integer_by_control(&self, id: &str) -> i32 {
        let Some(control_ref) = self.control_ref else {
            return -1;
        };
        let Some(output) = control_ref.integer_output(id) else {
            return -1;
        };
        let word = self.get_u16(output.address);
        ((word & output.mask) >> output.shift) as i32
    }

    /// Write an integer control; rejects out-of-range values.
    ///
    /// Returns `false` (no side effect) if the control is unknown, has no
    /// integer output, or `value` is outside `0..=max_value`.
    pub fn set_integer_by_control(&mut self, control_ref: &ControlReferenceStore, id: &str, value: i32) -> bool {
        let Some(output) = control_ref.integer_output(id) else {
            return false;
        };
        if value < 0 || value as u16 > output.max_value {
            return false;
        }
        // Minimal contiguous bit mask covering max_value, shifted into place.
        let mut mask: u16 = 0x0001;
        while mask < output.max_value {
            mask = (mask << 1) | 1;
        }
        mask <<= output.shift;

        let current = self.get_u16(output.address);
        let cleared = current & !mask;
        let new_word = cleared | ((value as u16) << output.shift);
        self.set_u16(output.address, new_word);
        true
    }

    /// Read a string control: up to `max_length` bytes, low-byte-first per
    /// word, stopping at the first zero byte.
    pub fn get_string_by_control(&self, control_ref: &ControlReferenceStore, id: &str) -> String {
        let Some(output) = control_ref.string_output(id) else {
            return String::new();
        };
        let mut bytes = Vec::with_capacity(output.max_length as usize);
        let mut addr = output.address;
        let mut remaining = output.max_length;
        'outer: while remaining > 0 {
            let word = self.get_u16(addr);
            for shift in [0u16, 8] {
                if remaining == 0 {
                    break 'outer;
                }
                let b = ((word >> shift) & 0xFF) as u8;
                if b == 0 {
                    break 'outer;
                }
                bytes.push(b);
                remaining -= 1;
            }
            addr = addr.wrapping_add(2);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Write a string control: truncate to `max_length`, right-pad with
    /// spaces to exactly `max_length`, then write it byte-wise.
    pub fn set_string_by_control(&mut self, control_ref: &ControlReferenceStore, id: &str, value: &str) -> bool {
        let Some(output) = control_ref.string_output(id) else {
            return false;
        };
        let mut bytes = value.as_bytes().to_vec();
        bytes.truncate(output.max_length as usize);
        bytes.resize(output.max_length as usize, b' ');
        self.set_bytes(output.address, &bytes);
        true
    }

    /// Immutable snapshot of the dirty + value pairs, in ascending address order.
    pub fn snapshot(&self) -> Frame {
        Frame {
            entries: Arc::new(self.guard.words.clone()),
        }
    }

    /// Clear all dirty flags.
    pub fn clear_dirty_flags(&mut self) {
        for w in &mut self.guard.words {
            w.dirty = false;
        }
    }

    /// Discard all entries.
    pub fn reset(&mut self) {
        self.guard.words.clear();
    }

    /// Direct access to the sorted entries, for the encoder.
    pub fn words(&self) -> &[DataWord] {
        &self.guard.words
    }

    /// Mutable access to the sorted entries, for the encoder's dirty sweeps.
    pub fn words_mut(&mut self) -> &mut Vec<DataWord> {
        &mut self.guard.words
    }
}

/// Suppress the "unused" warning for `OutputKind` re-export path used by
/// doctests in sibling modules.
#[allow(dead_code)]
fn _assert_output_kind_reachable(_: OutputKind) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_u16_inserts_in_ascending_order() {
        let store = ShadowStore::new();
        store.set_u16(0x0100, 1);
        store.set_u16(0x0002, 2);
        store.set_u16(0x0050, 3);
        let snap = store.snapshot();
        let addrs: Vec<u16> = snap.entries().iter().map(|w| w.address).collect();
        assert_eq!(addrs, vec![0x0002, 0x0050, 0x0100]);
    }

    #[test]
    fn dirty_minimization_same_value_no_dirty() {
        let store = ShadowStore::new();
        store.set_u16(0x10, 5);
        store.clear_dirty_flags();
        store.set_u16(0x10, 5); // same value
        let snap = store.snapshot();
        assert!(!snap.entries()[0].dirty);
    }

    #[test]
    fn dirty_set_on_value_change() {
        let store = ShadowStore::new();
        store.set_u16(0x10, 5);
        store.clear_dirty_flags();
        store.set_u16(0x10, 6);
        let snap = store.snapshot();
        assert!(snap.entries()[0].dirty);
        assert_eq!(snap.entries()[0].data, 6);
    }

    #[test]
    fn get_u16_default_zero() {
        let store = ShadowStore::new();
        assert_eq!(store.get_u16(0x1234), 0);
    }

    #[test]
    fn set_bytes_packs_low_byte_first() {
        let store = ShadowStore::new();
        store.lock().set_bytes(0x0000, &[0xAB, 0xCD, 0x11]);
        assert_eq!(store.get_u16(0x0000), 0xCDAB);
        // trailing odd byte preserves the high byte of the next word (0 here).
        assert_eq!(store.get_u16(0x0002) & 0x00FF, 0x11);
    }

    #[test]
    fn reset_clears_all_entries() {
        let store = ShadowStore::new();
        store.set_u16(0x10, 1);
        store.reset();
        assert_eq!(store.snapshot().entries().len(), 0);
    }
}

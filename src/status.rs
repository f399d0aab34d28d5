// status.rs

use std::cell::Cell;

use critical_section::Mutex;

/// Bytes of status text retained from the last control message.
pub const STATUS_LEN: usize = 4;

/// Single slot holding the latest inbound control value.
///
/// Written by the receive path, read by the shell. Every access is one
/// critical section, so a reader never sees a half-written value.
pub struct StatusStore {
    slot: Mutex<Cell<[u8; STATUS_LEN]>>,
}

impl StatusStore {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(Cell::new([0; STATUS_LEN])),
        }
    }

    /// Keep the first [`STATUS_LEN`] bytes of `data`, zero-padding the rest.
    /// Longer input is truncated.
    pub fn write(&self, data: &[u8]) {
        let mut value = [0u8; STATUS_LEN];
        let n = data.len().min(STATUS_LEN);
        value[..n].copy_from_slice(&data[..n]);
        critical_section::with(|cs| self.slot.borrow(cs).set(value));
    }

    pub fn read(&self) -> [u8; STATUS_LEN] {
        critical_section::with(|cs| self.slot.borrow(cs).get())
    }

    /// Slot contents up to the first zero byte, lossily decoded.
    pub fn text(&self) -> String {
        let value = self.read();
        let end = value.iter().position(|&b| b == 0).unwrap_or(STATUS_LEN);
        String::from_utf8_lossy(&value[..end]).into_owned()
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}


// EOF

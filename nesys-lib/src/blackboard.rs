//! State shared between the controller and the background worker
//!
//! The controller publishes connection settings and the drive selection,
//! the worker publishes status lines and the active profile id. Every
//! access takes one short-lived lock and gives up after a bounded wait, so
//! neither side can stall the other.

use crate::constants::BLACKBOARD_LOCK_WAIT;
use crate::volume::DriveMask;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::trace;

/// A single-slot mailbox. Setting replaces any unread value, taking clears it.
#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Option<T>,
}

impl<T> Mailbox<T> {
    pub const fn new() -> Self {
        Self { slot: None }
    }

    pub fn set(&mut self, value: T) {
        self.slot = Some(value);
    }

    pub fn take(&mut self) -> Option<T> {
        self.slot.take()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct Board {
    status_text: Mailbox<String>,
    profile_id_text: Mailbox<String>,
    shared_key: Mailbox<Vec<u8>>,
    selected_drives: DriveMask,
    port: Option<u16>,
    server_address: Option<String>,
    game_exe_name: Option<String>,
    stop_requested: bool,
}

#[derive(Debug)]
pub struct Blackboard {
    board: Mutex<Board>,
    lock_wait: Duration,
}

impl Default for Blackboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Blackboard {
    pub fn new() -> Self {
        Self::with_lock_wait(BLACKBOARD_LOCK_WAIT)
    }

    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            board: Mutex::new(Board::default()),
            lock_wait,
        }
    }

    fn with_board<R>(&self, field: &'static str, f: impl FnOnce(&mut Board) -> R) -> Option<R> {
        match self.board.try_lock_for(self.lock_wait) {
            Some(mut board) => Some(f(&mut board)),
            None => {
                trace!(field, "blackboard lock wait expired");
                None
            }
        }
    }

    // Take-once slots

    pub fn set_status(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        self.with_board("status_text", |b| b.status_text.set(text)).is_some()
    }

    pub fn take_status(&self) -> Option<String> {
        self.with_board("status_text", |b| b.status_text.take()).flatten()
    }

    pub fn set_profile_id_text(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        self.with_board("profile_id_text", |b| b.profile_id_text.set(text))
            .is_some()
    }

    pub fn take_profile_id_text(&self) -> Option<String> {
        self.with_board("profile_id_text", |b| b.profile_id_text.take())
            .flatten()
    }

    pub fn set_shared_key(&self, key: impl Into<Vec<u8>>) -> bool {
        let key = key.into();
        self.with_board("shared_key", |b| b.shared_key.set(key)).is_some()
    }

    pub fn take_shared_key(&self) -> Option<Vec<u8>> {
        self.with_board("shared_key", |b| b.shared_key.take()).flatten()
    }

    // Persistent values

    pub fn set_selected_drives(&self, drives: DriveMask) -> bool {
        self.with_board("selected_drives", |b| b.selected_drives = drives)
            .is_some()
    }

    pub fn selected_drives(&self) -> Option<DriveMask> {
        self.with_board("selected_drives", |b| b.selected_drives)
    }

    pub fn set_port(&self, port: u16) -> bool {
        self.with_board("port", |b| b.port = Some(port)).is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.with_board("port", |b| b.port).flatten()
    }

    pub fn set_server_address(&self, address: impl Into<String>) -> bool {
        let address = address.into();
        self.with_board("server_address", |b| b.server_address = Some(address))
            .is_some()
    }

    pub fn server_address(&self) -> Option<String> {
        self.with_board("server_address", |b| b.server_address.clone())
            .flatten()
    }

    pub fn set_game_exe_name(&self, name: impl Into<String>) -> bool {
        let name = name.into();
        self.with_board("game_exe_name", |b| b.game_exe_name = Some(name))
            .is_some()
    }

    pub fn game_exe_name(&self) -> Option<String> {
        self.with_board("game_exe_name", |b| b.game_exe_name.clone())
            .flatten()
    }

    pub fn request_stop(&self) -> bool {
        self.with_board("stop_requested", |b| b.stop_requested = true)
            .is_some()
    }

    /// Reads `false` if the lock could not be taken in time
    pub fn stop_requested(&self) -> bool {
        self.with_board("stop_requested", |b| b.stop_requested)
            .unwrap_or(false)
    }
}

use crate::blackboard::Blackboard;
use crate::constants::{DEFAULT_EXE_NAME, DEFAULT_PORT, DEFAULT_SERVER_ADDRESS, DRIVE_MASK_BITS};
use crate::error::{NesysError, io_err};
use crate::process::MemoryLayout;
use crate::volume::{DriveMask, MountedVolumes};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_SETTINGS_FILE: &str = "nesys-config.json";

/// Persisted controller settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_address: String,
    pub port: u16,
    /// Shared key for request authentication
    pub access_code: String,
    pub exe_name: String,
    /// Selected drive slots, bit n is drive letter `'A' + n`
    pub drives: u32,
    /// Mount root of each drive letter, e.g. `"E": "/media/usb0"`
    pub drive_roots: BTreeMap<String, PathBuf>,
    pub memory_layout: MemoryLayout,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            access_code: String::new(),
            exe_name: DEFAULT_EXE_NAME.to_string(),
            drives: 0,
            drive_roots: BTreeMap::new(),
            memory_layout: MemoryLayout::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, NesysError> {
        let text = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let mut settings: Settings = serde_json::from_str(&text)?;
        settings.drives &= DRIVE_MASK_BITS;
        Ok(settings)
    }

    /// Like [`Settings::load`], but a missing file yields the defaults
    pub fn load_or_default(path: &Path) -> Result<Self, NesysError> {
        match Self::load(path) {
            Err(NesysError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "settings file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Load the settings file, falling back to defaults if it does not
    /// exist, then write the result back so every key is on disk.
    pub fn load_or_init(path: &Path) -> Result<Self, NesysError> {
        let settings = Self::load_or_default(path)?;
        settings.save(path)?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), NesysError> {
        let mut on_disk = self.clone();
        on_disk.drives &= DRIVE_MASK_BITS;
        let text = serde_json::to_string_pretty(&on_disk)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        fs::write(path, text).map_err(|e| io_err(path, e))?;
        debug!(path = %path.display(), "settings saved");
        Ok(())
    }

    pub fn drive_mask(&self) -> DriveMask {
        DriveMask::new(self.drives)
    }

    pub fn volumes(&self) -> MountedVolumes {
        MountedVolumes::from_letters(&self.drive_roots)
    }

    /// Hand the connection settings and drive selection to the worker
    pub fn apply_to(&self, board: &Blackboard) {
        board.set_server_address(self.server_address.clone());
        board.set_port(self.port);
        board.set_game_exe_name(self.exe_name.clone());
        board.set_shared_key(self.access_code.as_bytes().to_vec());
        board.set_selected_drives(self.drive_mask());
    }
}

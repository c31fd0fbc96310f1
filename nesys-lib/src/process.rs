//! Access to the target process's profile block
//!
//! The worker only sees the [`ProcessInspector`] trait. On Linux the
//! [`ProcMemInspector`] locates the process through `/proc`, resolves the
//! base address of its executable mapping and reads or writes the block
//! through `/proc/<pid>/mem`. Other platforms get an inspector that never
//! finds anything.

use crate::constants::{CAR_PROFILE_SIZE, DRESS_UP_RANGE, SHORT_NAME_SIZE};
use crate::error::NesysError;
use crate::profile::CarProfile;
use serde::{Deserialize, Serialize};

/// Where the profile block and its flags live, relative to the base of the
/// executable's mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLayout {
    /// Offset of the 304-byte block from the executable base
    pub block_offset: u64,
    /// Offsets below are relative to the start of the block
    pub active_offset: usize,
    pub tuned_offset: usize,
    pub short_name_offset: usize,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            block_offset: 0x3F_25E0,
            active_offset: 140,
            tuned_offset: 220,
            short_name_offset: 260,
        }
    }
}

impl MemoryLayout {
    /// Absolute address of `offset` within the block
    pub fn address(&self, base: u64, offset: usize) -> u64 {
        base.wrapping_add(self.block_offset).wrapping_add(offset as u64)
    }
}

/// Operations the worker needs on the target process.
///
/// Read failures while the process is still alive are reported as
/// [`NesysError::ProcessAccess`]. A failure after the process has exited is
/// not an error for the worker, it just starts over.
pub trait ProcessInspector: Send {
    type Handle: Send + Sync;

    fn find_process(&self, exe_name: &str) -> Option<Self::Handle>;

    fn is_alive(&self, handle: &Self::Handle) -> bool;

    /// Read the whole block. The tuned flag is cleared in the returned copy
    /// so that toggling it never counts as a change.
    fn read_block(&self, handle: &Self::Handle) -> Result<CarProfile, NesysError>;

    fn write_block(&self, handle: &Self::Handle, profile: &CarProfile) -> Result<(), NesysError>;

    fn is_profile_active(&self, handle: &Self::Handle) -> Result<bool, NesysError>;

    fn is_tuned(&self, handle: &Self::Handle) -> Result<bool, NesysError>;

    /// The short car name used as the plate text, at most 4 bytes
    fn read_short_name(&self, handle: &Self::Handle) -> Result<String, NesysError>;

    /// Write only the dress-up range of `profile`
    fn write_dress_up(&self, handle: &Self::Handle, profile: &CarProfile) -> Result<(), NesysError>;
}

/// Decode a short name: stop at the first NUL, keep at most 4 bytes.
pub fn short_name_from_bytes(raw: &[u8]) -> String {
    let raw = &raw[..raw.len().min(SHORT_NAME_SIZE)];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Clear the tuned flag in a block read from memory
pub fn clear_tuned_flag(profile: &mut CarProfile, layout: &MemoryLayout) {
    if layout.tuned_offset < CAR_PROFILE_SIZE {
        profile.as_bytes_mut()[layout.tuned_offset] = 0;
    }
}

#[cfg(target_os = "linux")]
pub use linux::{ProcHandle, ProcMemInspector};

#[cfg(target_os = "linux")]
pub type DefaultInspector = ProcMemInspector;

#[cfg(not(target_os = "linux"))]
pub type DefaultInspector = UnsupportedInspector;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::fs::{self, File, OpenOptions};
    use std::io;
    use std::os::unix::fs::FileExt;
    use std::path::{Path, PathBuf};
    use tracing::{debug, trace};

    /// An attached process. `base` is `None` if the executable mapping
    /// could not be resolved.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ProcHandle {
        pub pid: u32,
        pub base: Option<u64>,
    }

    #[derive(Debug, Clone)]
    pub struct ProcMemInspector {
        layout: MemoryLayout,
        proc_root: PathBuf,
    }

    impl Default for ProcMemInspector {
        fn default() -> Self {
            Self::new(MemoryLayout::default())
        }
    }

    impl ProcMemInspector {
        pub fn new(layout: MemoryLayout) -> Self {
            Self {
                layout,
                proc_root: PathBuf::from("/proc"),
            }
        }

        pub fn layout(&self) -> &MemoryLayout {
            &self.layout
        }

        /// Attach to a known pid, resolving the base of the mapping named
        /// `exe_name`.
        pub fn attach(&self, pid: u32, exe_name: &str) -> ProcHandle {
            let base = self.base_address(pid, exe_name);
            if base.is_none() {
                debug!(pid, exe_name, "executable mapping not found");
            }
            ProcHandle { pid, base }
        }

        fn pid_dir(&self, pid: u32) -> PathBuf {
            self.proc_root.join(pid.to_string())
        }

        fn matches_name(&self, pid_dir: &Path, exe_name: &str) -> bool {
            if let Ok(target) = fs::read_link(pid_dir.join("exe")) {
                if file_name_matches(&target.to_string_lossy(), exe_name) {
                    return true;
                }
            }
            // Wine and friends show the Windows path in argv[0]
            match fs::read(pid_dir.join("cmdline")) {
                Ok(cmdline) => {
                    let argv0 = cmdline.split(|b| *b == 0).next().unwrap_or_default();
                    file_name_matches(&String::from_utf8_lossy(argv0), exe_name)
                }
                Err(_) => false,
            }
        }

        fn base_address(&self, pid: u32, exe_name: &str) -> Option<u64> {
            let maps = fs::read_to_string(self.pid_dir(pid).join("maps")).ok()?;
            maps.lines().find_map(|line| {
                let mut fields = line.split_whitespace();
                let range = fields.next()?;
                let path = fields.nth(4)?;
                if !file_name_matches(path, exe_name) {
                    return None;
                }
                let start = range.split('-').next()?;
                u64::from_str_radix(start, 16).ok()
            })
        }

        fn mem_error(&self, handle: &ProcHandle, err: io::Error) -> NesysError {
            NesysError::ProcessAccess(format!("pid {}: {err}", handle.pid))
        }

        fn read_at(&self, handle: &ProcHandle, offset: usize, buf: &mut [u8]) -> Result<(), NesysError> {
            let base = resolved_base(handle)?;
            let file = File::open(self.pid_dir(handle.pid).join("mem"))
                .map_err(|e| self.mem_error(handle, e))?;
            file.read_exact_at(buf, self.layout.address(base, offset))
                .map_err(|e| self.mem_error(handle, e))
        }

        fn write_at(&self, handle: &ProcHandle, offset: usize, data: &[u8]) -> Result<(), NesysError> {
            let base = resolved_base(handle)?;
            let file = OpenOptions::new()
                .write(true)
                .open(self.pid_dir(handle.pid).join("mem"))
                .map_err(|e| self.mem_error(handle, e))?;
            file.write_all_at(data, self.layout.address(base, offset))
                .map_err(|e| self.mem_error(handle, e))
        }

        fn read_flag(&self, handle: &ProcHandle, offset: usize) -> Result<bool, NesysError> {
            let mut flag = [0u8; 1];
            self.read_at(handle, offset, &mut flag)?;
            Ok(flag[0] != 0)
        }
    }

    fn resolved_base(handle: &ProcHandle) -> Result<u64, NesysError> {
        handle.base.ok_or_else(|| {
            NesysError::ProcessAccess(format!("pid {}: can't get base address", handle.pid))
        })
    }

    fn file_name_matches(path: &str, exe_name: &str) -> bool {
        path.rsplit(['/', '\\'])
            .next()
            .is_some_and(|name| name.eq_ignore_ascii_case(exe_name))
    }

    impl ProcessInspector for ProcMemInspector {
        type Handle = ProcHandle;

        fn find_process(&self, exe_name: &str) -> Option<ProcHandle> {
            let entries = fs::read_dir(&self.proc_root).ok()?;
            let pid = entries
                .filter_map(Result::ok)
                .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
                .find(|pid| self.matches_name(&self.pid_dir(*pid), exe_name))?;
            trace!(pid, exe_name, "found process");
            Some(self.attach(pid, exe_name))
        }

        fn is_alive(&self, handle: &ProcHandle) -> bool {
            self.pid_dir(handle.pid).join("mem").exists()
        }

        fn read_block(&self, handle: &ProcHandle) -> Result<CarProfile, NesysError> {
            let mut profile = CarProfile::zeroed();
            self.read_at(handle, 0, profile.as_bytes_mut())?;
            clear_tuned_flag(&mut profile, &self.layout);
            Ok(profile)
        }

        fn write_block(&self, handle: &ProcHandle, profile: &CarProfile) -> Result<(), NesysError> {
            self.write_at(handle, 0, profile.as_bytes())
        }

        fn is_profile_active(&self, handle: &ProcHandle) -> Result<bool, NesysError> {
            self.read_flag(handle, self.layout.active_offset)
        }

        fn is_tuned(&self, handle: &ProcHandle) -> Result<bool, NesysError> {
            self.read_flag(handle, self.layout.tuned_offset)
        }

        fn read_short_name(&self, handle: &ProcHandle) -> Result<String, NesysError> {
            let mut raw = [0u8; SHORT_NAME_SIZE];
            self.read_at(handle, self.layout.short_name_offset, &mut raw)?;
            Ok(short_name_from_bytes(&raw))
        }

        fn write_dress_up(&self, handle: &ProcHandle, profile: &CarProfile) -> Result<(), NesysError> {
            self.write_at(handle, DRESS_UP_RANGE.start, profile.dress_up())
        }
    }

}

/// Inspector for platforms without `/proc`. It never finds a process.
#[derive(Debug, Clone, Default)]
pub struct UnsupportedInspector;

impl UnsupportedInspector {
    pub fn new(_layout: MemoryLayout) -> Self {
        Self
    }
}

impl ProcessInspector for UnsupportedInspector {
    type Handle = ();

    fn find_process(&self, _exe_name: &str) -> Option<()> {
        None
    }

    fn is_alive(&self, _handle: &()) -> bool {
        false
    }

    fn read_block(&self, _handle: &()) -> Result<CarProfile, NesysError> {
        Err(unsupported())
    }

    fn write_block(&self, _handle: &(), _profile: &CarProfile) -> Result<(), NesysError> {
        Err(unsupported())
    }

    fn is_profile_active(&self, _handle: &()) -> Result<bool, NesysError> {
        Err(unsupported())
    }

    fn is_tuned(&self, _handle: &()) -> Result<bool, NesysError> {
        Err(unsupported())
    }

    fn read_short_name(&self, _handle: &()) -> Result<String, NesysError> {
        Err(unsupported())
    }

    fn write_dress_up(&self, _handle: &(), _profile: &CarProfile) -> Result<(), NesysError> {
        Err(unsupported())
    }
}

fn unsupported() -> NesysError {
    NesysError::ProcessAccess("process memory access is not supported on this platform".to_string())
}

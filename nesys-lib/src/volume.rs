use crate::constants::{DRIVE_COUNT, DRIVE_MASK_BITS};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Set of drive slots. Bit n stands for drive letter `'A' + n`, only the
/// low 26 bits are used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DriveMask(u32);

impl DriveMask {
    pub const EMPTY: DriveMask = DriveMask(0);

    pub fn new(bits: u32) -> Self {
        Self(bits & DRIVE_MASK_BITS)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, slot: u8) -> bool {
        slot < DRIVE_COUNT && self.0 & (1 << slot) != 0
    }

    pub fn with(self, slot: u8) -> Self {
        if slot < DRIVE_COUNT {
            Self(self.0 | (1 << slot))
        } else {
            self
        }
    }

    pub fn intersect(self, other: DriveMask) -> Self {
        Self(self.0 & other.0)
    }

    /// Selected slots in ascending order
    pub fn slots(&self) -> impl Iterator<Item = u8> + '_ {
        (0..DRIVE_COUNT).filter(|slot| self.contains(*slot))
    }

    /// Build a mask from drive letters, e.g. `"DE"`. Unknown characters are
    /// skipped.
    pub fn from_letters(letters: &str) -> Self {
        letters
            .chars()
            .filter_map(slot_for_letter)
            .fold(Self::EMPTY, Self::with)
    }
}

impl fmt::Display for DriveMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for slot in self.slots() {
            write!(f, "{}", letter_for_slot(slot))?;
        }
        Ok(())
    }
}

pub fn letter_for_slot(slot: u8) -> char {
    (b'A' + slot) as char
}

pub fn slot_for_letter(letter: char) -> Option<u8> {
    let upper = letter.to_ascii_uppercase();
    upper
        .is_ascii_uppercase()
        .then(|| upper as u8 - b'A')
}

/// A removable volume currently present on the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub slot: u8,
    pub root: PathBuf,
}

impl Volume {
    pub fn letter(&self) -> char {
        letter_for_slot(self.slot)
    }
}

/// Source of the removable volumes the worker may use.
pub trait VolumeScanner: Send {
    /// Volumes present right now, ordered by slot
    fn removable_volumes(&self) -> Vec<Volume>;

    /// Present volumes whose slot is in `selected`
    fn selected_volumes(&self, selected: DriveMask) -> Vec<Volume> {
        self.removable_volumes()
            .into_iter()
            .filter(|v| selected.contains(v.slot))
            .collect()
    }

    /// Slots of every present volume
    fn live_mask(&self) -> DriveMask {
        self.removable_volumes()
            .iter()
            .fold(DriveMask::EMPTY, |mask, v| mask.with(v.slot))
    }
}

/// Volumes configured as slot → mount root. A slot is present while its
/// root exists as a directory.
#[derive(Debug, Clone, Default)]
pub struct MountedVolumes {
    roots: BTreeMap<u8, PathBuf>,
}

impl MountedVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `letter → root` pairs as stored in the settings file.
    /// Entries whose key is not a drive letter are ignored.
    pub fn from_letters<'a>(entries: impl IntoIterator<Item = (&'a String, &'a PathBuf)>) -> Self {
        let mut volumes = Self::new();
        for (letter, root) in entries {
            let mut chars = letter.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                if let Some(slot) = slot_for_letter(c) {
                    volumes.insert(slot, root.clone());
                }
            }
        }
        volumes
    }

    pub fn insert(&mut self, slot: u8, root: impl Into<PathBuf>) {
        if slot < DRIVE_COUNT {
            self.roots.insert(slot, root.into());
        }
    }

    pub fn root(&self, slot: u8) -> Option<&Path> {
        self.roots.get(&slot).map(PathBuf::as_path)
    }
}

impl VolumeScanner for MountedVolumes {
    fn removable_volumes(&self) -> Vec<Volume> {
        self.roots
            .iter()
            .filter(|(slot, root)| {
                let present = root.is_dir();
                if !present {
                    trace!(drive = %letter_for_slot(**slot), root = %root.display(), "volume not mounted");
                }
                present
            })
            .map(|(slot, root)| Volume {
                slot: *slot,
                root: root.clone(),
            })
            .collect()
    }
}

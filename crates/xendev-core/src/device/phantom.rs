//! Phantom device names.
//!
//! Names are `xvd<letter><slot>` with the letter taken from
//! [`PHANTOM_LETTERS`] and the slot from `1..=15`. The allocator walks the
//! space in order from where it last stopped, skipping names that exist in
//! the device directory or are still handed out, and gives up after wrapping
//! past the last letter twice.

use std::collections::HashSet;
use std::path::Path;

use crate::error::{CoreError, Result};

/// Letters usable for phantom devices.
pub const PHANTOM_LETTERS: [char; 13] = ['c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'l', 'm', 'n', 'o', 'p'];

/// Highest slot per letter.
pub const PHANTOM_SLOTS: u8 = 15;

/// Hands out phantom device names in the privileged domain.
#[derive(Debug, Default)]
pub struct PhantomAllocator {
    letter: usize,
    slot: u8,
    live: HashSet<String>,
}

impl PhantomAllocator {
    /// Creates an allocator starting at `xvdc1`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next free name, skipping those present in `dev_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Exhausted`] when no name is free.
    pub fn allocate(&mut self, dev_dir: &Path) -> Result<String> {
        let mut wrapped = false;
        loop {
            self.slot += 1;
            if self.slot > PHANTOM_SLOTS {
                if self.letter + 1 == PHANTOM_LETTERS.len() {
                    if wrapped {
                        return Err(CoreError::Exhausted(
                            "no loopback block devices are available".to_string(),
                        ));
                    }
                    wrapped = true;
                    self.letter = 0;
                } else {
                    self.letter += 1;
                }
                self.slot = 1;
            }
            let name = format!("xvd{}{}", PHANTOM_LETTERS[self.letter], self.slot);
            if self.live.contains(&name) || dev_dir.join(&name).exists() {
                continue;
            }
            tracing::debug!(%name, "phantom device name allocated");
            self.live.insert(name.clone());
            return Ok(name);
        }
    }

    /// Returns `name` to the pool. Unknown names are ignored.
    pub fn release(&mut self, name: &str) {
        if self.live.remove(name) {
            tracing::debug!(%name, "phantom device name released");
        }
    }

    /// Number of names handed out.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOTAL: usize = PHANTOM_LETTERS.len() * PHANTOM_SLOTS as usize;

    #[test]
    fn test_sequence_starts_at_xvdc1() {
        let dir = tempfile::tempdir().unwrap();
        let mut alloc = PhantomAllocator::new();
        assert_eq!(alloc.allocate(dir.path()).unwrap(), "xvdc1");
        assert_eq!(alloc.allocate(dir.path()).unwrap(), "xvdc2");
    }

    #[test]
    fn test_slot_overflow_advances_letter_and_skips_k() {
        let dir = tempfile::tempdir().unwrap();
        let mut alloc = PhantomAllocator::new();
        let names: Vec<String> = (0..15 * 8 + 1)
            .map(|_| alloc.allocate(dir.path()).unwrap())
            .collect();
        assert_eq!(names[14], "xvdc15");
        assert_eq!(names[15], "xvdd1");
        assert_eq!(names[15 * 8], "xvdl1");
        assert!(names.iter().all(|n| !n.starts_with("xvdk")));
    }

    #[test]
    fn test_skips_existing_device_nodes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("xvdc1"), b"").unwrap();
        std::fs::write(dir.path().join("xvdc2"), b"").unwrap();
        let mut alloc = PhantomAllocator::new();
        assert_eq!(alloc.allocate(dir.path()).unwrap(), "xvdc3");
    }

    #[test]
    fn test_released_names_are_reused_after_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let mut alloc = PhantomAllocator::new();
        let names: Vec<String> = (0..TOTAL).map(|_| alloc.allocate(dir.path()).unwrap()).collect();
        assert_eq!(names.last().unwrap(), "xvdp15");

        alloc.release("xvde7");
        assert_eq!(alloc.live_count(), TOTAL - 1);
        assert_eq!(alloc.allocate(dir.path()).unwrap(), "xvde7");
        assert_eq!(alloc.live_count(), TOTAL);
    }

    #[test]
    fn test_exhaustion_after_full_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut alloc = PhantomAllocator::new();
        for _ in 0..TOTAL {
            alloc.allocate(dir.path()).unwrap();
        }
        let err = alloc.allocate(dir.path()).unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(alloc.live_count(), TOTAL);
    }

    #[test]
    fn test_exhaustion_when_every_node_exists() {
        let dir = tempfile::tempdir().unwrap();
        for letter in PHANTOM_LETTERS {
            for slot in 1..=PHANTOM_SLOTS {
                std::fs::write(dir.path().join(format!("xvd{letter}{slot}")), b"").unwrap();
            }
        }
        let mut alloc = PhantomAllocator::new();
        assert!(alloc.allocate(dir.path()).unwrap_err().is_exhausted());
    }
}

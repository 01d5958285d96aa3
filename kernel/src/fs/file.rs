//! Per-task open-file table
//!
//! Fixed slots over the read-only initrd: an open file is a byte range
//! into the archive plus a cursor. Descriptors 0-2 are the console and are
//! not stored here; user descriptors start at [`FIRST_USER_FD`].

use crate::error::{KernelError, KernelResult};

/// Open descriptors per task (beyond stdin/stdout/stderr).
pub const MAX_OPEN_FILES: usize = 32;
/// First descriptor number backed by the table.
pub const FIRST_USER_FD: i32 = 3;

/// One open file: a window into the initrd plus a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    /// Byte offset of the file data inside the archive.
    pub offset: usize,
    /// File length.
    pub len: usize,
    /// Read cursor, clamped to `[0, len]`.
    pub pos: usize,
    /// Flags passed to open (kept for fcntl).
    pub flags: u32,
}

/// Fixed-slot descriptor table.
#[derive(Debug, Clone)]
pub struct FileTable {
    slots: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_OPEN_FILES],
        }
    }

    fn slot_of(fd: i32) -> Option<usize> {
        if fd < FIRST_USER_FD {
            return None;
        }
        let idx = (fd - FIRST_USER_FD) as usize;
        (idx < MAX_OPEN_FILES).then_some(idx)
    }

    /// Claim a slot for an archive range; returns the descriptor.
    pub fn open(&mut self, offset: usize, len: usize, flags: u32) -> KernelResult<i32> {
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::ResourceExhausted {
                resource: "file descriptors",
            })?;
        self.slots[idx] = Some(OpenFile {
            offset,
            len,
            pos: 0,
            flags,
        });
        Ok(idx as i32 + FIRST_USER_FD)
    }

    pub fn get(&self, fd: i32) -> Option<&OpenFile> {
        Self::slot_of(fd).and_then(|idx| self.slots[idx].as_ref())
    }

    pub fn get_mut(&mut self, fd: i32) -> Option<&mut OpenFile> {
        Self::slot_of(fd).and_then(|idx| self.slots[idx].as_mut())
    }

    /// Release a descriptor. Closing stdin/stdout/stderr is a no-op.
    pub fn close(&mut self, fd: i32) -> KernelResult<()> {
        if (0..FIRST_USER_FD).contains(&fd) {
            return Ok(());
        }
        let idx = Self::slot_of(fd).ok_or(KernelError::NotFound {
            what: "file descriptor",
        })?;
        if self.slots[idx].take().is_none() {
            return Err(KernelError::NotFound {
                what: "file descriptor",
            });
        }
        Ok(())
    }

    /// Duplicate onto the lowest free slot.
    pub fn dup(&mut self, fd: i32) -> KernelResult<i32> {
        let file = *self.get(fd).ok_or(KernelError::NotFound {
            what: "file descriptor",
        })?;
        self.open(file.offset, file.len, file.flags).map(|new_fd| {
            if let Some(slot) = self.get_mut(new_fd) {
                slot.pos = file.pos;
            }
            new_fd
        })
    }

    /// Duplicate onto a specific descriptor, closing whatever was there.
    pub fn dup2(&mut self, fd: i32, new_fd: i32) -> KernelResult<i32> {
        let file = *self.get(fd).ok_or(KernelError::NotFound {
            what: "file descriptor",
        })?;
        if fd == new_fd {
            return Ok(new_fd);
        }
        let idx = Self::slot_of(new_fd).ok_or(KernelError::InvalidAddress {
            addr: new_fd as u32,
        })?;
        self.slots[idx] = Some(file);
        Ok(new_fd)
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn descriptors_start_at_three_and_reuse_slots() {
        let mut table = FileTable::new();
        let a = table.open(0, 100, 0).expect("slot available");
        let b = table.open(512, 50, 0).expect("slot available");
        assert_eq!(a, 3);
        assert_eq!(b, 4);

        table.close(a).expect("close a");
        let c = table.open(1024, 10, 0).expect("slot available");
        assert_eq!(c, 3);
    }

    #[test]
    fn std_descriptors_close_as_noops() {
        let mut table = FileTable::new();
        for fd in 0..3 {
            table.close(fd).expect("std fds close silently");
        }
        assert!(table.close(3).is_err());
        assert!(table.close(-1).is_err());
    }

    #[test]
    fn table_capacity_is_emfile_material() {
        let mut table = FileTable::new();
        for _ in 0..MAX_OPEN_FILES {
            table.open(0, 1, 0).expect("slots remain");
        }
        assert!(matches!(
            table.open(0, 1, 0),
            Err(KernelError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn dup_copies_cursor_dup2_replaces_target() {
        let mut table = FileTable::new();
        let fd = table.open(0, 100, 0).expect("open");
        table.get_mut(fd).expect("slot").pos = 42;

        let dup = table.dup(fd).expect("dup");
        assert_ne!(dup, fd);
        assert_eq!(table.get(dup).expect("dup slot").pos, 42);

        let other = table.open(512, 9, 0).expect("open other");
        let replaced = table.dup2(fd, other).expect("dup2");
        assert_eq!(replaced, other);
        assert_eq!(table.get(other).expect("slot").offset, 0);
        assert_eq!(table.get(other).expect("slot").len, 100);
    }
}

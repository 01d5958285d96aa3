//! Read-only filesystem surface
//!
//! The root filesystem is the boot initrd, a POSIX ustar archive looked up
//! by path. Open files are slots in a fixed per-task table carrying byte
//! ranges into the archive.

pub mod file;
pub mod initrd;

pub use file::{FileTable, OpenFile, FIRST_USER_FD, MAX_OPEN_FILES};
pub use initrd::Initrd;

//! Device-facing collaborators
//!
//! Only the console lives in-tree; real device drivers (keyboard, timer,
//! serial, audio) are external to this core and interact through the IRQ
//! registration API in `trap`.

pub mod console;

pub use console::{Console, CONSOLE};

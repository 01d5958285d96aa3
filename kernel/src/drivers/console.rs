//! VGA text console
//!
//! A byte sink over the 80x25 text buffer with the standard attribute
//! colors, guarded by an interrupt-saving spinlock. The allocator-free
//! emergency paths in `arch::x86::vga` bypass this lock on purpose; IRQ
//! handlers must use those, never this console.

use core::fmt;

use crate::arch::x86::vga::{
    ColorCode, TextBuffer, DEFAULT_COLOR, VGA_HEIGHT, VGA_WIDTH,
};
use crate::sync::IrqSpinLock;

struct Writer {
    buf: TextBuffer,
    row: usize,
    col: usize,
    color: ColorCode,
}

impl Writer {
    const fn new() -> Self {
        Self {
            buf: TextBuffer::new(),
            row: 0,
            col: 0,
            color: DEFAULT_COLOR,
        }
    }

    fn newline(&mut self) {
        self.col = 0;
        if self.row + 1 < VGA_HEIGHT {
            self.row += 1;
        } else {
            // Scroll everything up one row.
            for row in 1..VGA_HEIGHT {
                self.buf.copy_row(row - 1, row);
            }
            self.buf.clear_row(VGA_HEIGHT - 1, self.color);
        }
    }

    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.col = 0,
            b'\t' => {
                let next = (self.col + 8) & !7;
                while self.col < next.min(VGA_WIDTH) {
                    self.buf.write_cell(self.row, self.col, b' ', self.color);
                    self.col += 1;
                }
            }
            byte => {
                if self.col >= VGA_WIDTH {
                    self.newline();
                }
                self.buf.write_cell(self.row, self.col, byte, self.color);
                self.col += 1;
            }
        }
    }

    fn clear(&mut self) {
        self.buf.clear(self.color);
        self.row = 0;
        self.col = 0;
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// The console: shared byte sink over VGA text.
pub struct Console {
    inner: IrqSpinLock<Writer>,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            inner: IrqSpinLock::new(Writer::new()),
        }
    }

    /// Write raw bytes; returns how many were consumed (always all).
    pub fn write_bytes(&self, bytes: &[u8]) -> usize {
        let mut writer = self.inner.acquire();
        for &byte in bytes {
            writer.write_byte(byte);
        }
        bytes.len()
    }

    pub fn write_fmt(&self, args: fmt::Arguments) {
        let mut writer = self.inner.acquire();
        let _ = fmt::write(&mut *writer, args);
    }

    pub fn set_color(&self, color: ColorCode) {
        self.inner.acquire().color = color;
    }

    pub fn clear(&self) {
        self.inner.acquire().clear();
    }

    /// Printable text of one row (host assertions).
    #[cfg(not(target_os = "none"))]
    pub fn row_text(&self, row: usize) -> alloc::string::String {
        let writer = self.inner.acquire();
        let mut raw = [0u8; VGA_WIDTH];
        let len = writer.buf.row_text(row, &mut raw);
        alloc::string::String::from_utf8_lossy(&raw[..len]).into_owned()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// Global console instance
pub static CONSOLE: Console = Console::new();

/// Plumbing for the `print!`/`println!` macros.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    CONSOLE.write_fmt(args);
}

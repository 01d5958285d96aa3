//! VGA text buffer
//!
//! 80x25 text cells at physical 0xB8000, mirrored at 0xC00B8000 once paging
//! is on. The host build swaps the MMIO pointer for an in-struct cell array
//! so console output and the panic screen can be asserted against in tests.
//!
//! The panic screen layout is fixed: row 0 is the banner (white on red),
//! row 1 the error category, row 2 the context line, and rows 4+ carry the
//! fault registers when present.

use core::fmt;

/// Text mode width in cells.
pub const VGA_WIDTH: usize = 80;
/// Text mode height in cells.
pub const VGA_HEIGHT: usize = 25;

/// Physical address of the text buffer.
pub const VGA_TEXT_PHYS: u32 = 0xB8000;
/// Higher-half alias mapped by the VMM.
pub const VGA_TEXT_HIGHER_HALF: u32 = 0xC00B_8000;

/// Standard 4-bit VGA colors.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// Foreground/background attribute byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ColorCode(u8);

impl ColorCode {
    pub const fn new(foreground: Color, background: Color) -> Self {
        Self((background as u8) << 4 | foreground as u8)
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

/// Default console attribute.
pub const DEFAULT_COLOR: ColorCode = ColorCode::new(Color::LightGray, Color::Black);
/// Panic banner attribute.
pub const PANIC_BANNER_COLOR: ColorCode = ColorCode::new(Color::White, Color::Red);
/// Panic detail attribute.
pub const PANIC_DETAIL_COLOR: ColorCode = ColorCode::new(Color::Yellow, Color::Red);

const fn cell(byte: u8, color: ColorCode) -> u16 {
    (color.as_u8() as u16) << 8 | byte as u16
}

/// The text buffer itself.
///
/// On bare metal this is a zero-sized handle onto the MMIO region (the
/// active base flips to the higher-half alias after paging is enabled).
/// On the host it owns its cells.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub struct TextBuffer;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod base {
    use core::sync::atomic::{AtomicU32, Ordering};

    static VGA_BASE: AtomicU32 = AtomicU32::new(super::VGA_TEXT_PHYS);

    /// Switch MMIO access to the higher-half alias (called right after
    /// paging is enabled).
    pub fn use_higher_half() {
        VGA_BASE.store(super::VGA_TEXT_HIGHER_HALF, Ordering::SeqCst);
    }

    pub fn base() -> *mut u16 {
        VGA_BASE.load(Ordering::SeqCst) as *mut u16
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use base::use_higher_half;

#[cfg(all(target_arch = "x86", target_os = "none"))]
impl TextBuffer {
    pub const fn new() -> Self {
        Self
    }

    pub fn write_cell(&mut self, row: usize, col: usize, byte: u8, color: ColorCode) {
        if row >= VGA_HEIGHT || col >= VGA_WIDTH {
            return;
        }
        unsafe {
            base::base()
                .add(row * VGA_WIDTH + col)
                .write_volatile(cell(byte, color));
        }
    }

    pub fn read_cell(&self, row: usize, col: usize) -> u16 {
        if row >= VGA_HEIGHT || col >= VGA_WIDTH {
            return 0;
        }
        unsafe { base::base().add(row * VGA_WIDTH + col).read_volatile() }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub struct TextBuffer {
    cells: [u16; VGA_WIDTH * VGA_HEIGHT],
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
impl TextBuffer {
    pub const fn new() -> Self {
        Self {
            cells: [0; VGA_WIDTH * VGA_HEIGHT],
        }
    }

    pub fn write_cell(&mut self, row: usize, col: usize, byte: u8, color: ColorCode) {
        if row >= VGA_HEIGHT || col >= VGA_WIDTH {
            return;
        }
        self.cells[row * VGA_WIDTH + col] = cell(byte, color);
    }

    pub fn read_cell(&self, row: usize, col: usize) -> u16 {
        if row >= VGA_HEIGHT || col >= VGA_WIDTH {
            return 0;
        }
        self.cells[row * VGA_WIDTH + col]
    }
}

impl TextBuffer {
    /// Copy one row over another (used by scrolling).
    pub fn copy_row(&mut self, dst: usize, src: usize) {
        for col in 0..VGA_WIDTH {
            let value = self.read_cell(src, col);
            self.write_cell(dst, col, (value & 0xFF) as u8, ColorCode((value >> 8) as u8));
        }
    }

    /// Blank a whole row with the given attribute.
    pub fn clear_row(&mut self, row: usize, color: ColorCode) {
        for col in 0..VGA_WIDTH {
            self.write_cell(row, col, b' ', color);
        }
    }

    pub fn clear(&mut self, color: ColorCode) {
        for row in 0..VGA_HEIGHT {
            self.clear_row(row, color);
        }
    }

    /// Write a string into a row starting at `col`, clipping at the edge.
    pub fn write_str_at(&mut self, row: usize, col: usize, s: &str, color: ColorCode) {
        for (i, byte) in s.bytes().enumerate() {
            if col + i >= VGA_WIDTH {
                break;
            }
            self.write_cell(row, col + i, byte, color);
        }
    }

    /// Extract the printable text of a row (host assertions).
    pub fn row_text(&self, row: usize, out: &mut [u8; VGA_WIDTH]) -> usize {
        let mut len = 0;
        for col in 0..VGA_WIDTH {
            let byte = (self.read_cell(row, col) & 0xFF) as u8;
            out[col] = byte;
            if byte != b' ' && byte != 0 {
                len = col + 1;
            }
        }
        len
    }
}

impl Default for TextBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Panic screen
// ---------------------------------------------------------------------------

/// Register context shown on the panic screen when a fault is involved.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicRegs {
    pub cr2: Option<u32>,
    pub error_code: Option<u32>,
    pub esp: u32,
    pub eip: u32,
}

struct HexBuf {
    buf: [u8; 10],
}

impl HexBuf {
    fn format(value: u32) -> Self {
        let mut buf = *b"0x00000000";
        let digits = b"0123456789ABCDEF";
        for i in 0..8 {
            buf[9 - i] = digits[((value >> (i * 4)) & 0xF) as usize];
        }
        Self { buf }
    }

    fn as_str(&self) -> &str {
        // Only ASCII hex digits are ever written.
        core::str::from_utf8(&self.buf).unwrap_or("0x????????")
    }
}

/// Paint the fatal-error screen. Pure function of the buffer so it can run
/// on the emergency path (no locks, no allocation) and in host tests.
pub fn panic_screen(buf: &mut TextBuffer, category: &str, context: &str, regs: Option<&PanicRegs>) {
    buf.clear(PANIC_DETAIL_COLOR);
    buf.clear_row(0, PANIC_BANNER_COLOR);
    buf.write_str_at(0, 0, "*** EMBEROS KERNEL PANIC ***", PANIC_BANNER_COLOR);
    buf.write_str_at(1, 0, category, PANIC_DETAIL_COLOR);
    buf.write_str_at(2, 0, context, PANIC_DETAIL_COLOR);

    if let Some(regs) = regs {
        let mut row = 4;
        if let Some(cr2) = regs.cr2 {
            buf.write_str_at(row, 0, "CR2: ", PANIC_DETAIL_COLOR);
            buf.write_str_at(row, 5, HexBuf::format(cr2).as_str(), PANIC_DETAIL_COLOR);
            row += 1;
        }
        if let Some(err) = regs.error_code {
            buf.write_str_at(row, 0, "ERR: ", PANIC_DETAIL_COLOR);
            buf.write_str_at(row, 5, HexBuf::format(err).as_str(), PANIC_DETAIL_COLOR);
            row += 1;
        }
        buf.write_str_at(row, 0, "ESP: ", PANIC_DETAIL_COLOR);
        buf.write_str_at(row, 5, HexBuf::format(regs.esp).as_str(), PANIC_DETAIL_COLOR);
        row += 1;
        buf.write_str_at(row, 0, "EIP: ", PANIC_DETAIL_COLOR);
        buf.write_str_at(row, 5, HexBuf::format(regs.eip).as_str(), PANIC_DETAIL_COLOR);
    }
}

/// Emergency one-liner used by contexts that must not touch the console
/// lock (double fault, recursion guard, canary failure).
pub fn emergency_message(row: usize, msg: &str) {
    let mut buf = TextBuffer::new();
    buf.clear_row(row, PANIC_BANNER_COLOR);
    buf.write_str_at(row, 0, msg, PANIC_BANNER_COLOR);
}

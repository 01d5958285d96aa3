//! Initrd archive (POSIX ustar)
//!
//! The bootloader's first module is a tar archive; the only operation the
//! kernel needs is "given a path, produce bytes". Paths are normalized
//! before matching: leading `./` and `/` stripped, trailing `/` stripped.

/// Every tar header and data run is a multiple of this.
const BLOCK_SIZE: usize = 512;

/// ustar header field offsets/sizes.
mod field {
    pub const NAME_OFF: usize = 0;
    pub const NAME_LEN: usize = 100;

    /// File size in octal ASCII (12 bytes).
    pub const SIZE_OFF: usize = 124;
    pub const SIZE_LEN: usize = 12;

    /// '0' or '\0' = regular file, '5' = directory.
    pub const TYPE_OFF: usize = 156;

    /// "ustar\0" for POSIX archives.
    pub const MAGIC_OFF: usize = 257;
    pub const MAGIC_LEN: usize = 6;

    /// Name prefix for paths longer than 100 bytes.
    pub const PREFIX_OFF: usize = 345;
    pub const PREFIX_LEN: usize = 155;
}

/// Parse a NUL-terminated ASCII string from a fixed-size tar field.
fn parse_str(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    core::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// Parse an octal ASCII number from a tar field.
fn parse_octal(buf: &[u8]) -> usize {
    let s = parse_str(buf).trim();
    if s.is_empty() {
        return 0;
    }
    usize::from_str_radix(s, 8).unwrap_or(0)
}

fn is_zero_block(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Strip leading `./`, leading `/`, and trailing `/`.
pub fn normalize(path: &str) -> &str {
    let mut p = path;
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest;
        } else {
            break;
        }
    }
    p.strip_suffix('/').unwrap_or(p)
}

/// One archive entry.
#[derive(Debug, Clone, Copy)]
pub struct InitrdEntry<'a> {
    prefix: &'a str,
    name: &'a str,
    /// Byte offset of the file data within the archive.
    pub offset: usize,
    pub size: usize,
    pub typeflag: u8,
}

impl<'a> InitrdEntry<'a> {
    pub fn is_file(&self) -> bool {
        self.typeflag == b'0' || self.typeflag == 0
    }

    /// Match against a normalized query path without assembling the full
    /// prefixed name.
    fn matches(&self, query: &str) -> bool {
        let name = normalize(self.name);
        if self.prefix.is_empty() {
            return name == query;
        }
        let prefix = normalize(self.prefix);
        query
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(|rest| rest == name)
            .unwrap_or(false)
    }
}

/// Global initrd, installed once by the boot path from the first
/// Multiboot module.
pub static INITRD: spin::Once<Initrd<'static>> = spin::Once::new();

/// A parsed view over the initrd bytes.
pub struct Initrd<'a> {
    data: &'a [u8],
}

impl<'a> Initrd<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Iterate the archive entries.
    pub fn entries(&self) -> InitrdIter<'a> {
        InitrdIter {
            data: self.data,
            offset: 0,
        }
    }

    /// Find a regular file by path. Returns its bytes.
    pub fn find(&self, path: &str) -> Option<&'a [u8]> {
        let (offset, size) = self.file_range(path)?;
        Some(&self.data[offset..offset + size])
    }

    /// Find a regular file by path; returns (offset, size) into the
    /// archive so callers can keep handles without borrowing the entry.
    pub fn file_range(&self, path: &str) -> Option<(usize, usize)> {
        let query = normalize(path);
        if query.is_empty() {
            return None;
        }
        self.entries()
            .find(|e| e.is_file() && e.matches(query))
            .map(|e| (e.offset, e.size))
    }

    pub fn file_count(&self) -> usize {
        self.entries().filter(InitrdEntry::is_file).count()
    }
}

/// Iterator over ustar headers.
pub struct InitrdIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for InitrdIter<'a> {
    type Item = InitrdEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.offset + BLOCK_SIZE > self.data.len() {
                return None;
            }
            let header = &self.data[self.offset..self.offset + BLOCK_SIZE];
            if is_zero_block(header) {
                // Two zero blocks end the archive; a stray one is skipped.
                if self.offset + 2 * BLOCK_SIZE <= self.data.len()
                    && is_zero_block(&self.data[self.offset + BLOCK_SIZE..self.offset + 2 * BLOCK_SIZE])
                {
                    return None;
                }
                self.offset += BLOCK_SIZE;
                continue;
            }

            let magic = parse_str(&header[field::MAGIC_OFF..field::MAGIC_OFF + field::MAGIC_LEN]);
            if !magic.is_empty() && !magic.starts_with("ustar") {
                self.offset += BLOCK_SIZE;
                continue;
            }

            let name = parse_str(&header[field::NAME_OFF..field::NAME_OFF + field::NAME_LEN]);
            let prefix =
                parse_str(&header[field::PREFIX_OFF..field::PREFIX_OFF + field::PREFIX_LEN]);
            let size = parse_octal(&header[field::SIZE_OFF..field::SIZE_OFF + field::SIZE_LEN]);
            let typeflag = header[field::TYPE_OFF];

            let data_offset = self.offset + BLOCK_SIZE;
            let data_blocks = size.div_ceil(BLOCK_SIZE);
            self.offset = data_offset + data_blocks * BLOCK_SIZE;

            if data_offset + size > self.data.len() {
                return None;
            }

            return Some(InitrdEntry {
                prefix,
                name,
                offset: data_offset,
                size,
                typeflag,
            });
        }
    }
}


#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::test_support::build_tar;
    use super::*;

    fn archive() -> alloc::vec::Vec<u8> {
        build_tar(&[
            ("bin/shell.elf", b"\x7fELFshell"),
            ("etc/motd", b"welcome to the machine\n"),
            ("bin/ls", b"ls-binary"),
        ])
    }

    #[test]
    fn lookup_by_exact_path() {
        let data = archive();
        let initrd = Initrd::new(&data);
        assert_eq!(initrd.find("bin/shell.elf"), Some(&b"\x7fELFshell"[..]));
        assert_eq!(initrd.find("etc/motd").map(|d| d.len()), Some(23));
        assert_eq!(initrd.find("no/such/file"), None);
        assert_eq!(initrd.file_count(), 3);
    }

    #[test]
    fn paths_are_normalized() {
        let data = archive();
        let initrd = Initrd::new(&data);
        for query in ["/bin/shell.elf", "./bin/shell.elf", "bin/shell.elf/", "//bin/shell.elf"] {
            assert!(initrd.find(query).is_some(), "query {:?}", query);
        }
        assert_eq!(initrd.find(""), None);
        assert_eq!(initrd.find("/"), None);
    }

    #[test]
    fn truncated_archive_is_safe() {
        let mut data = archive();
        data.truncate(600); // header + partial data
        let initrd = Initrd::new(&data);
        assert_eq!(initrd.find("etc/motd"), None);
    }

    #[test]
    fn empty_buffer_has_no_entries() {
        let initrd = Initrd::new(&[]);
        assert_eq!(initrd.entries().count(), 0);
    }
}

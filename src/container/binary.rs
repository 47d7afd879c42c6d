//! Checks on the executable mounted into the container.
//!
//! The container image is Alpine (musl). A binary that asks for a dynamic
//! loader through a `PT_INTERP` program header will not start there, so it is
//! rejected on the host before any container runs.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::BuildError;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const PT_INTERP: u32 = 3;

/// Interpreter paths are short; anything longer is a corrupt header.
const MAX_INTERP_LEN: u64 = 4096;

/// Header fields needed to walk the program headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ElfHeader {
    is_64: bool,
    little_endian: bool,
    phoff: u64,
    phentsize: u16,
    phnum: u16,
}

impl ElfHeader {
    fn parse(buf: &[u8; 64]) -> Result<Self> {
        if buf[..4] != ELF_MAGIC {
            bail!("not an ELF executable");
        }
        let is_64 = match buf[4] {
            ELFCLASS32 => false,
            ELFCLASS64 => true,
            other => bail!("unknown ELF class {other}"),
        };
        let little_endian = match buf[5] {
            ELFDATA2LSB => true,
            ELFDATA2MSB => false,
            other => bail!("unknown ELF data encoding {other}"),
        };
        let r = Fields { buf, little_endian };
        let header = if is_64 {
            Self {
                is_64,
                little_endian,
                phoff: r.u64(0x20),
                phentsize: r.u16(0x36),
                phnum: r.u16(0x38),
            }
        } else {
            Self {
                is_64,
                little_endian,
                phoff: u64::from(r.u32(0x1c)),
                phentsize: r.u16(0x2a),
                phnum: r.u16(0x2c),
            }
        };
        let min_entry = if is_64 { 56 } else { 32 };
        if header.phnum > 0 && usize::from(header.phentsize) < min_entry {
            bail!("program header entries of {} bytes are too small", header.phentsize);
        }
        Ok(header)
    }
}

struct Fields<'a> {
    buf: &'a [u8],
    little_endian: bool,
}

impl Fields<'_> {
    fn bytes<const N: usize>(&self, off: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[off..off + N]);
        out
    }

    fn u16(&self, off: usize) -> u16 {
        let b = self.bytes::<2>(off);
        if self.little_endian {
            u16::from_le_bytes(b)
        } else {
            u16::from_be_bytes(b)
        }
    }

    fn u32(&self, off: usize) -> u32 {
        let b = self.bytes::<4>(off);
        if self.little_endian {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        }
    }

    fn u64(&self, off: usize) -> u64 {
        let b = self.bytes::<8>(off);
        if self.little_endian {
            u64::from_le_bytes(b)
        } else {
            u64::from_be_bytes(b)
        }
    }
}

/// The dynamic loader an ELF executable requests, or `None` for a static one.
pub fn interpreter(path: &Path) -> Result<Option<String>> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut ident = [0u8; 64];
    file.read_exact(&mut ident)
        .with_context(|| format!("{} is too short to be an ELF executable", path.display()))?;
    let header = ElfHeader::parse(&ident).with_context(|| format!("reading {}", path.display()))?;

    if header.phnum == 0 {
        return Ok(None);
    }
    let table_len = usize::from(header.phentsize) * usize::from(header.phnum);
    let mut table = vec![0u8; table_len];
    file.seek(SeekFrom::Start(header.phoff))?;
    file.read_exact(&mut table)
        .with_context(|| format!("reading program headers of {}", path.display()))?;

    for entry in table.chunks_exact(usize::from(header.phentsize)) {
        let r = Fields {
            buf: entry,
            little_endian: header.little_endian,
        };
        if r.u32(0) != PT_INTERP {
            continue;
        }
        let (offset, size) = if header.is_64 {
            (r.u64(0x08), r.u64(0x20))
        } else {
            (u64::from(r.u32(0x04)), u64::from(r.u32(0x10)))
        };
        if size > MAX_INTERP_LEN {
            bail!("PT_INTERP of {} bytes in {}", size, path.display());
        }
        let mut raw = vec![0u8; size as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut raw)?;
        let text = String::from_utf8_lossy(&raw);
        return Ok(Some(text.trim_end_matches('\0').to_string()));
    }
    Ok(None)
}

/// Fail with [`BuildError::PipelineBinary`] unless `binary` is a statically
/// linked ELF executable.
pub fn ensure_static(binary: &Path) -> Result<(), BuildError> {
    let unusable = |detail: String| BuildError::PipelineBinary {
        path: binary.to_path_buf(),
        detail,
    };
    match interpreter(binary) {
        Ok(None) => Ok(()),
        Ok(Some(loader)) => Err(unusable(format!(
            "dynamically linked (needs {loader}); build a static binary, e.g. \
             `cargo build --release --target x86_64-unknown-linux-musl`, and pass it with --binary"
        ))),
        Err(e) => Err(unusable(format!("{e:#}"))),
    }
}

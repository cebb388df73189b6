//! Shared byte region with a validated, optionally checksummed header.
//!
//! Layout: a 24-byte big-endian header followed by `size` payload bytes.
//!
//! ```text
//! offset  field      value
//! 0       magic      0x474F4E45
//! 4       version    1
//! 8       size       payload length in bytes
//! 12      flags      BufferFlags bits
//! 16      checksum   FNV-1a over the payload (when CHECKSUMED)
//! 20      reserved   0
//! ```

use bitflags::bitflags;
use parking_lot::RwLock;

use gonex_core::{GonexError, GonexResult};

/// Header magic: the bytes `GONE`.
pub const MAGIC: u32 = 0x474F_4E45;
/// Current header version.
pub const VERSION: u32 = 1;
/// Header length in bytes.
pub const HEADER_SIZE: usize = 24;

bitflags! {
    /// Behavior bits stored in the header's `flags` field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        const READ_ONLY = 1;
        const COMPRESSED = 2;
        const ENCRYPTED = 4;
        const CHECKSUMED = 8;
        const CIRCULAR = 16;
    }
}

/// FNV-1a, 32 bit. The header checksum only guards against corruption, not
/// tampering.
fn checksum32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn read_u32_be(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_be_bytes(buf)
}

fn write_u32_be(bytes: &mut [u8], offset: usize, v: u32) {
    bytes[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
}

/// A shared byte region: header plus payload. Shared across threads behind
/// an `Arc`; reads take a shared lock, mutations an exclusive one.
#[derive(Debug)]
pub struct SharedMemoryBuffer {
    region: RwLock<Vec<u8>>,
}

impl SharedMemoryBuffer {
    /// Allocate a zeroed region with `size` payload bytes.
    pub fn allocate(size: usize, flags: BufferFlags) -> Self {
        let mut region = vec![0u8; HEADER_SIZE + size];
        write_u32_be(&mut region, 0, MAGIC);
        write_u32_be(&mut region, 4, VERSION);
        write_u32_be(&mut region, 8, size as u32);
        write_u32_be(&mut region, 12, flags.bits());
        if flags.contains(BufferFlags::CHECKSUMED) {
            let sum = checksum32(&region[HEADER_SIZE..]);
            write_u32_be(&mut region, 16, sum);
        }
        Self {
            region: RwLock::new(region),
        }
    }

    /// Attach to an existing region, validating the header (and the
    /// checksum when the region carries one).
    pub fn attach(region: Vec<u8>) -> GonexResult<Self> {
        let buffer = Self {
            region: RwLock::new(region),
        };
        buffer.validate_header()?;
        Ok(buffer)
    }

    /// Validate magic, version, declared size, and checksum.
    pub fn validate_header(&self) -> GonexResult<()> {
        let region = self.region.read();
        if region.len() < HEADER_SIZE {
            return Err(GonexError::InvalidHeader {
                reason: format!("region too small: {} bytes", region.len()),
            });
        }
        let magic = read_u32_be(&region, 0);
        if magic != MAGIC {
            return Err(GonexError::InvalidHeader {
                reason: format!("bad magic {magic:#010x}"),
            });
        }
        let version = read_u32_be(&region, 4);
        if version != VERSION {
            return Err(GonexError::InvalidHeader {
                reason: format!("unsupported version {version}"),
            });
        }
        let size = read_u32_be(&region, 8) as usize;
        if region.len() != HEADER_SIZE + size {
            return Err(GonexError::InvalidHeader {
                reason: format!(
                    "declared size {size} does not match region of {} bytes",
                    region.len()
                ),
            });
        }
        let flags = BufferFlags::from_bits_truncate(read_u32_be(&region, 12));
        if flags.contains(BufferFlags::CHECKSUMED) {
            let stored = read_u32_be(&region, 16);
            let actual = checksum32(&region[HEADER_SIZE..]);
            if stored != actual {
                return Err(GonexError::ChecksumMismatch {
                    expected: stored,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        read_u32_be(&self.region.read(), 8) as usize
    }

    pub fn flags(&self) -> BufferFlags {
        BufferFlags::from_bits_truncate(read_u32_be(&self.region.read(), 12))
    }

    pub fn is_read_only(&self) -> bool {
        self.flags().contains(BufferFlags::READ_ONLY)
    }

    /// The stored checksum field (meaningful only under CHECKSUMED).
    pub fn checksum(&self) -> u32 {
        read_u32_be(&self.region.read(), 16)
    }

    /// Copy `len` payload bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> GonexResult<Vec<u8>> {
        let region = self.region.read();
        let size = read_u32_be(&region, 8) as usize;
        if offset + len > size {
            return Err(GonexError::OutOfBounds { offset, len, size });
        }
        let start = HEADER_SIZE + offset;
        Ok(region[start..start + len].to_vec())
    }

    /// Write payload bytes at `offset`, maintaining the checksum when the
    /// region carries one. Rejected on READ_ONLY regions.
    pub fn write(&self, offset: usize, data: &[u8]) -> GonexResult<()> {
        let mut region = self.region.write();
        let size = read_u32_be(&region, 8) as usize;
        let flags = BufferFlags::from_bits_truncate(read_u32_be(&region, 12));
        if flags.contains(BufferFlags::READ_ONLY) {
            return Err(GonexError::ReadOnlyBuffer);
        }
        if offset + data.len() > size {
            return Err(GonexError::OutOfBounds {
                offset,
                len: data.len(),
                size,
            });
        }
        let start = HEADER_SIZE + offset;
        region[start..start + data.len()].copy_from_slice(data);
        if flags.contains(BufferFlags::CHECKSUMED) {
            let sum = checksum32(&region[HEADER_SIZE..]);
            write_u32_be(&mut region, 16, sum);
        }
        Ok(())
    }

    /// Zero the payload. Rejected on READ_ONLY regions.
    pub fn clear(&self) -> GonexResult<()> {
        let mut region = self.region.write();
        let flags = BufferFlags::from_bits_truncate(read_u32_be(&region, 12));
        if flags.contains(BufferFlags::READ_ONLY) {
            return Err(GonexError::ReadOnlyBuffer);
        }
        for b in region[HEADER_SIZE..].iter_mut() {
            *b = 0;
        }
        if flags.contains(BufferFlags::CHECKSUMED) {
            let sum = checksum32(&region[HEADER_SIZE..]);
            write_u32_be(&mut region, 16, sum);
        }
        Ok(())
    }

    /// Snapshot the whole region, header included. What `attach` accepts.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.region.read().clone()
    }
}

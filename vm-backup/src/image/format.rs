//! Block image header encoding.

use crate::utils::errors::{BackupError, Result};
use uuid::Uuid;

pub const MAGIC: &[u8; 8] = b"XOBDI\0\0\x01";
pub const HEADER_LEN: usize = 64;
pub const IMAGE_EXTENSION: &str = "bdi";

/// Upper bound for a block, keeps a corrupt header from driving huge allocations
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

const FLAG_HAS_PARENT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub uuid: Uuid,
    pub parent: Option<Uuid>,
    pub block_size: u32,
    pub virtual_size: u64,
    pub block_count: u32,
}

impl ImageHeader {
    /// Number of addressable blocks for the virtual size
    pub fn max_blocks(&self) -> u64 {
        self.virtual_size.div_ceil(self.block_size as u64)
    }

    /// Size of the index table in bytes
    pub fn table_len(&self) -> u64 {
        self.block_count as u64 * 4
    }

    /// Total length of a well-formed image with this header
    pub fn expected_len(&self) -> u64 {
        HEADER_LEN as u64 + self.table_len() + self.block_count as u64 * self.block_size as u64
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.virtual_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.block_count.to_le_bytes());
        let flags = if self.parent.is_some() { FLAG_HAS_PARENT } else { 0 };
        buf[24..28].copy_from_slice(&flags.to_le_bytes());
        buf[28..44].copy_from_slice(self.uuid.as_bytes());
        if let Some(parent) = self.parent {
            buf[44..60].copy_from_slice(parent.as_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(BackupError::InvalidImage(format!(
                "header truncated ({} bytes)",
                buf.len()
            )));
        }
        if &buf[0..8] != MAGIC {
            return Err(BackupError::InvalidImage("bad magic".into()));
        }

        let block_size = u32::from_le_bytes(le_array(&buf[8..12]));
        let virtual_size = u64::from_le_bytes(le_array(&buf[12..20]));
        let block_count = u32::from_le_bytes(le_array(&buf[20..24]));
        let flags = u32::from_le_bytes(le_array(&buf[24..28]));

        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(BackupError::InvalidImage(format!("invalid block size {}", block_size)));
        }

        let uuid = Uuid::from_slice(&buf[28..44])
            .map_err(|e| BackupError::InvalidImage(e.to_string()))?;
        let parent = if flags & FLAG_HAS_PARENT != 0 {
            Some(
                Uuid::from_slice(&buf[44..60])
                    .map_err(|e| BackupError::InvalidImage(e.to_string()))?,
            )
        } else {
            None
        };

        let header = Self {
            uuid,
            parent,
            block_size,
            virtual_size,
            block_count,
        };
        if header.block_count as u64 > header.max_blocks() {
            return Err(BackupError::InvalidImage(format!(
                "{} blocks declared for {} addressable",
                header.block_count,
                header.max_blocks()
            )));
        }
        Ok(header)
    }
}

/// Decode and check an index table against its header
pub fn decode_table(header: &ImageHeader, buf: &[u8]) -> Result<Vec<u32>> {
    if buf.len() as u64 != header.table_len() {
        return Err(BackupError::InvalidImage("index table truncated".into()));
    }

    let max = header.max_blocks();
    let mut indices = Vec::with_capacity(header.block_count as usize);
    for chunk in buf.chunks_exact(4) {
        let index = u32::from_le_bytes(le_array(chunk));
        if index as u64 >= max {
            return Err(BackupError::InvalidImage(format!("block {} out of range", index)));
        }
        if indices.last().is_some_and(|&prev| prev >= index) {
            return Err(BackupError::InvalidImage("index table not sorted".into()));
        }
        indices.push(index);
    }
    Ok(indices)
}

pub fn encode_table(indices: &[u32]) -> Vec<u8> {
    indices.iter().flat_map(|i| i.to_le_bytes()).collect()
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

//! In-memory block images.
//!
//! Used by exporters to produce base and incremental images from raw disk
//! contents, and to turn a chain back into a raw disk.

use super::format::{decode_table, encode_table, ImageHeader, HEADER_LEN};
use crate::utils::errors::{BackupError, Result};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockImage {
    uuid: Uuid,
    parent: Option<Uuid>,
    block_size: u32,
    virtual_size: u64,
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl BlockImage {
    /// Build a base image holding every non-zero block of `disk`
    pub fn base(disk: &[u8], block_size: u32, uuid: Uuid) -> Self {
        let mut image = Self::empty(uuid, None, block_size, disk.len() as u64);
        for (index, block) in disk.chunks(block_size as usize).enumerate() {
            if block.iter().any(|&b| b != 0) {
                image.insert(index as u32, block);
            }
        }
        image
    }

    /// Build an incremental image holding the blocks of `current` that differ from `previous`
    ///
    /// # Example
    /// ```
    /// use vm_backup::image::BlockImage;
    /// use uuid::Uuid;
    ///
    /// let before = vec![0u8; 1024];
    /// let mut after = before.clone();
    /// after[600] = 7;
    ///
    /// let base = BlockImage::base(&before, 512, Uuid::new_v4());
    /// let delta = BlockImage::diff(&before, &after, 512, Uuid::new_v4(), base.uuid());
    /// assert_eq!(delta.block_indices(), vec![1]);
    /// assert_eq!(BlockImage::materialize(&[base, delta]).unwrap(), after);
    /// ```
    pub fn diff(previous: &[u8], current: &[u8], block_size: u32, uuid: Uuid, parent: Uuid) -> Self {
        let mut image = Self::empty(uuid, Some(parent), block_size, current.len() as u64);
        let bs = block_size as usize;
        for (index, block) in current.chunks(bs).enumerate() {
            let start = index * bs;
            let old = previous.get(start..(start + bs).min(previous.len())).unwrap_or(&[]);
            if !same_block(old, block) {
                image.insert(index as u32, block);
            }
        }
        image
    }

    pub fn empty(uuid: Uuid, parent: Option<Uuid>, block_size: u32, virtual_size: u64) -> Self {
        Self {
            uuid,
            parent,
            block_size,
            virtual_size,
            blocks: BTreeMap::new(),
        }
    }

    /// Store a block, zero padded to the block size
    pub fn insert(&mut self, index: u32, data: &[u8]) {
        let mut block = vec![0u8; self.block_size as usize];
        let len = data.len().min(block.len());
        block[..len].copy_from_slice(&data[..len]);
        self.blocks.insert(index, block);
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    pub fn block_indices(&self) -> Vec<u32> {
        self.blocks.keys().copied().collect()
    }

    pub fn header(&self) -> ImageHeader {
        ImageHeader {
            uuid: self.uuid,
            parent: self.parent,
            block_size: self.block_size,
            virtual_size: self.virtual_size,
            block_count: self.blocks.len() as u32,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = self.header();
        let mut out = Vec::with_capacity(header.expected_len() as usize);
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&encode_table(&self.block_indices()));
        for block in self.blocks.values() {
            out.extend_from_slice(block);
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let header = ImageHeader::decode(buf)?;
        if buf.len() as u64 != header.expected_len() {
            return Err(BackupError::InvalidImage(format!(
                "expected {} bytes, got {}",
                header.expected_len(),
                buf.len()
            )));
        }

        let table_end = HEADER_LEN + header.table_len() as usize;
        let indices = decode_table(&header, &buf[HEADER_LEN..table_end])?;
        let mut image = Self::empty(header.uuid, header.parent, header.block_size, header.virtual_size);
        let bs = header.block_size as usize;
        for (n, index) in indices.into_iter().enumerate() {
            let start = table_end + n * bs;
            image.blocks.insert(index, buf[start..start + bs].to_vec());
        }
        Ok(image)
    }

    /// Reconstruct the raw disk of the last image in `chain` (base first)
    pub fn materialize(chain: &[BlockImage]) -> Result<Vec<u8>> {
        let Some(last) = chain.last() else {
            return Ok(Vec::new());
        };
        if chain[0].parent.is_some() {
            return Err(BackupError::InvalidImage("chain does not start with a base image".into()));
        }
        for pair in chain.windows(2) {
            if pair[1].parent != Some(pair[0].uuid) {
                return Err(BackupError::InvalidImage(format!(
                    "image {} is not a child of {}",
                    pair[1].uuid, pair[0].uuid
                )));
            }
        }

        let mut disk = vec![0u8; last.virtual_size as usize];
        for image in chain {
            let bs = image.block_size as usize;
            for (&index, block) in &image.blocks {
                let start = index as usize * bs;
                if start >= disk.len() {
                    continue;
                }
                let end = (start + bs).min(disk.len());
                disk[start..end].copy_from_slice(&block[..end - start]);
            }
        }
        Ok(disk)
    }
}

/// Compare a block with its previous version, missing bytes count as zero
fn same_block(old: &[u8], new: &[u8]) -> bool {
    new.iter()
        .enumerate()
        .all(|(i, &b)| old.get(i).copied().unwrap_or(0) == b)
}

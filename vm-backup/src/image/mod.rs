//! Sparse block image format used for delta-mode artifacts (`.bdi`).
//!
//! Layout:
//! - 64-byte header (magic, block size, virtual size, block count, flags,
//!   image uuid, parent uuid)
//! - index table: `block_count` little-endian u32 block indices, strictly increasing
//! - block payloads, `block_size` bytes each, in index order
//!
//! A base image carries every non-zero block of a disk and has no parent. An
//! incremental image only carries the blocks that changed since its parent,
//! so applying a child's blocks over its parent yields the child's disk state
//! without needing anything older in the chain.

pub mod builder;
pub mod format;
pub mod reader;

pub use builder::BlockImage;
pub use format::{ImageHeader, HEADER_LEN, IMAGE_EXTENSION};
pub use reader::ImageReader;

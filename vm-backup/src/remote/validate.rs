//! Structural checks run on written artifacts before they are published.

use super::RemoteHandler;
use crate::image::{ImageHeader, ImageReader};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

const TAR_BLOCK: usize = 512;
const USTAR_MAGIC: &[u8] = b"ustar";
const USTAR_MAGIC_OFFSET: usize = 257;
const CHECKSUM_RANGE: std::ops::Range<usize> = 148..156;

#[async_trait]
pub trait ArtifactValidator: Send + Sync {
    /// Check the artifact stored at `temp_path`; an error prevents publication
    async fn validate(&self, handler: &dyn RemoteHandler, temp_path: &str) -> Result<()>;
}

/// Checks that an export is a tar archive (XVA)
#[derive(Debug, Default, Clone)]
pub struct XvaValidator;

#[async_trait]
impl ArtifactValidator for XvaValidator {
    async fn validate(&self, handler: &dyn RemoteHandler, temp_path: &str) -> Result<()> {
        let (head, size) = read_head(handler, temp_path, TAR_BLOCK).await?;
        check_tar(&head, size).map_err(|reason| BackupError::validation(temp_path, reason))
    }
}

fn check_tar(head: &[u8], size: u64) -> std::result::Result<(), String> {
    if head.len() < TAR_BLOCK {
        return Err(format!("too short for a tar archive ({} bytes)", size));
    }
    if &head[USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + USTAR_MAGIC.len()] != USTAR_MAGIC {
        return Err("missing ustar magic".into());
    }

    let stored = parse_octal(&head[CHECKSUM_RANGE]).ok_or("unreadable header checksum")?;
    let computed: u64 = head[..TAR_BLOCK]
        .iter()
        .enumerate()
        .map(|(i, &b)| if CHECKSUM_RANGE.contains(&i) { b' ' as u64 } else { b as u64 })
        .sum();
    if stored != computed {
        return Err(format!("header checksum mismatch ({} != {})", stored, computed));
    }

    if size % TAR_BLOCK as u64 != 0 {
        return Err(format!("size {} is not a multiple of {}", size, TAR_BLOCK));
    }
    Ok(())
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let digits: Vec<u8> = field
        .iter()
        .copied()
        .skip_while(|b| *b == b' ')
        .take_while(|b| (b'0'..=b'7').contains(b))
        .collect();
    if digits.is_empty() {
        return None;
    }
    Some(digits.iter().fold(0u64, |acc, d| acc * 8 + u64::from(d - b'0')))
}

/// Checks a block image and, optionally, its parent link.
///
/// The parsed header is kept for the caller once validation succeeded.
#[derive(Debug, Default)]
pub struct ImageValidator {
    expected_parent: Option<Option<Uuid>>,
    header: Mutex<Option<ImageHeader>>,
}

impl ImageValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the image to have exactly this parent (`None` for a base image)
    pub fn expect_parent(mut self, parent: Option<Uuid>) -> Self {
        self.expected_parent = Some(parent);
        self
    }

    pub fn header(&self) -> Option<ImageHeader> {
        *self.header.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn check(&self, handler: &dyn RemoteHandler, temp_path: &str) -> Result<ImageHeader> {
        let header = match handler.local_path(temp_path) {
            Some(path) => {
                let file = tokio::fs::File::open(&path).await?;
                drain(ImageReader::open(file).await?).await?
            }
            None => {
                let stream = handler.create_read_stream(temp_path).await?;
                drain(ImageReader::from_stream(stream).await?).await?
            }
        };

        if let Some(expected) = self.expected_parent {
            if header.parent != expected {
                return Err(BackupError::InvalidImage(format!(
                    "parent is {}, expected {}",
                    describe(header.parent),
                    describe(expected)
                )));
            }
        }
        Ok(header)
    }
}

#[async_trait]
impl ArtifactValidator for ImageValidator {
    async fn validate(&self, handler: &dyn RemoteHandler, temp_path: &str) -> Result<()> {
        match self.check(handler, temp_path).await {
            Ok(header) => {
                *self.header.lock().unwrap_or_else(PoisonError::into_inner) = Some(header);
                Ok(())
            }
            Err(BackupError::InvalidImage(reason)) => Err(BackupError::validation(temp_path, reason)),
            Err(e) => Err(e),
        }
    }
}

async fn drain<R>(mut reader: ImageReader<R>) -> Result<ImageHeader>
where
    R: tokio::io::AsyncRead + Unpin,
{
    while reader.next_block().await?.is_some() {}
    let header = *reader.header();
    reader.finish().await?;
    Ok(header)
}

fn describe(uuid: Option<Uuid>) -> String {
    uuid.map(|u| u.to_string()).unwrap_or_else(|| "none".to_string())
}

/// First `len` bytes of an artifact plus its total size
async fn read_head(handler: &dyn RemoteHandler, path: &str, len: usize) -> Result<(Vec<u8>, u64)> {
    if let Some(local) = handler.local_path(path) {
        let file = tokio::fs::File::open(&local).await?;
        let size = file.metadata().await?.len();
        let mut head = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut head).await?;
        return Ok((head, size));
    }

    let mut stream = handler.create_read_stream(path).await?;
    let mut head = Vec::with_capacity(len);
    let mut size = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if head.len() < len {
            let wanted = (len - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..wanted]);
        }
        size += chunk.len() as u64;
    }
    Ok((head, size))
}

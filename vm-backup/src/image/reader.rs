//! Streaming block image reader.

use super::format::{decode_table, ImageHeader, HEADER_LEN};
use crate::transfer::ByteStream;
use crate::utils::errors::{BackupError, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

/// Reads a block image sequentially without buffering the payload.
pub struct ImageReader<R> {
    reader: R,
    header: ImageHeader,
    indices: Vec<u32>,
    next: usize,
}

impl ImageReader<StreamReader<ByteStream, Bytes>> {
    /// Open an image from a remote read stream
    pub async fn from_stream(stream: ByteStream) -> Result<Self> {
        Self::open(StreamReader::new(stream)).await
    }
}

impl<R> ImageReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Read and check the header and index table
    pub async fn open(mut reader: R) -> Result<Self> {
        let mut head = [0u8; HEADER_LEN];
        read_exact(&mut reader, &mut head, "header").await?;
        let header = ImageHeader::decode(&head)?;

        let mut table = vec![0u8; header.table_len() as usize];
        read_exact(&mut reader, &mut table, "index table").await?;
        let indices = decode_table(&header, &table)?;

        Ok(Self {
            reader,
            header,
            indices,
            next: 0,
        })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Read the next stored block, `None` once every block has been read
    pub async fn next_block(&mut self) -> Result<Option<(u32, Bytes)>> {
        let Some(&index) = self.indices.get(self.next) else {
            return Ok(None);
        };
        let mut block = BytesMut::zeroed(self.header.block_size as usize);
        read_exact(&mut self.reader, &mut block, "block data").await?;
        self.next += 1;
        Ok(Some((index, block.freeze())))
    }

    /// Succeeds only when the reader is exhausted after the last block
    pub async fn finish(&mut self) -> Result<()> {
        if self.next != self.indices.len() {
            return Err(BackupError::InvalidImage("image not fully read".into()));
        }
        let mut probe = [0u8; 1];
        if self.reader.read(&mut probe).await? != 0 {
            return Err(BackupError::InvalidImage("trailing data after last block".into()));
        }
        Ok(())
    }
}

async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(BackupError::InvalidImage(format!("{} truncated", what)))
        }
        Err(e) => Err(e.into()),
    }
}

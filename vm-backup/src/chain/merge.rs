//! Streaming consolidation of a child image into its parent.

use crate::image::format::encode_table;
use crate::image::{ImageHeader, ImageReader};
use crate::remote::{ImageValidator, RemoteHandler, RemoteSession};
use crate::task::{Task, TaskDescriptor};
use crate::transfer::ByteStream;
use crate::utils::errors::{BackupError, Result};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tracing::info;
use uuid::Uuid;

type StreamImage = ImageReader<StreamReader<ByteStream, Bytes>>;

/// Result of one merge step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSummary {
    /// Identity of the consolidated image (the child's)
    pub uuid: Uuid,
    pub parent: Option<Uuid>,
    pub block_count: u32,
    pub child_blocks: u32,
    pub size: u64,
}

#[derive(Debug, Default, Clone)]
pub struct ChainMerger;

impl ChainMerger {
    pub fn new() -> Self {
        Self
    }

    /// Merge the image at `child_path` into the one at `parent_path`.
    ///
    /// Both remotes are acquired for the duration of the merge and released
    /// on every outcome.
    pub async fn merge_chain(
        &self,
        task: &Task,
        parent_handler: Arc<dyn RemoteHandler>,
        parent_path: &str,
        child_handler: Arc<dyn RemoteHandler>,
        child_path: &str,
    ) -> Result<MergeSummary> {
        let parent = RemoteSession::acquire(parent_handler).await?;
        let child = match RemoteSession::acquire(child_handler).await {
            Ok(child) => child,
            Err(e) => {
                parent.release().await;
                return Err(e);
            }
        };

        let result = self
            .merge_images(task, &*parent, parent_path, &*child, child_path)
            .await;

        child.release().await;
        parent.release().await;
        result
    }

    /// Merge on handlers the caller already synced.
    ///
    /// The consolidated image replaces the parent atomically and carries the
    /// child's identity. The child is removed once the consolidated image has
    /// been written and validated.
    pub async fn merge_images(
        &self,
        task: &Task,
        parent_handler: &dyn RemoteHandler,
        parent_path: &str,
        child_handler: &dyn RemoteHandler,
        child_path: &str,
    ) -> Result<MergeSummary> {
        let descriptor = TaskDescriptor::new("merge").with_data(json!({
            "parent": { "remote": parent_handler.id(), "path": parent_path },
            "child": { "remote": child_handler.id(), "path": child_path },
        }));

        task.run_child(descriptor, |merge_task| async move {
            let parent = ImageReader::from_stream(parent_handler.create_read_stream(parent_path).await?).await?;
            let child = ImageReader::from_stream(child_handler.create_read_stream(child_path).await?).await?;
            let plan = MergePlan::new(parent, child)?;
            let header = plan.header;
            let child_blocks = plan.child.header().block_count;

            let validator = ImageValidator::new().expect_parent(header.parent);
            let stream = plan.into_stream();
            let stats = merge_task
                .run_child(TaskDescriptor::new("consolidate"), |_| {
                    let validator = &validator;
                    async move {
                        parent_handler
                            .output_stream(parent_path, stream, Some(validator))
                            .await
                    }
                })
                .await?;

            merge_task
                .run_child(TaskDescriptor::new("remove child"), |_| async move {
                    child_handler.unlink(child_path).await
                })
                .await?;

            let summary = MergeSummary {
                uuid: header.uuid,
                parent: header.parent,
                block_count: header.block_count,
                child_blocks,
                size: stats.size,
            };
            info!(
                parent = %parent_path,
                child = %child_path,
                blocks = summary.block_count,
                size = summary.size,
                "Images merged"
            );
            merge_task.set_result(serde_json::to_value(&summary)?);
            Ok::<_, BackupError>(summary)
        })
        .await
    }
}

/// Sequential merge of two images whose index tables are already known
struct MergePlan {
    header: ImageHeader,
    parent: StreamImage,
    child: StreamImage,
    parent_head: Option<(u32, Bytes)>,
    parent_done: bool,
    child_head: Option<(u32, Bytes)>,
    child_done: bool,
    prelude: Option<Bytes>,
}

impl MergePlan {
    fn new(parent: StreamImage, child: StreamImage) -> Result<Self> {
        let (ph, ch) = (*parent.header(), *child.header());
        if ch.parent != Some(ph.uuid) {
            return Err(BackupError::ChainMerge(format!(
                "image {} is not a child of {}",
                ch.uuid, ph.uuid
            )));
        }
        if ch.block_size != ph.block_size {
            return Err(BackupError::ChainMerge(format!(
                "block size mismatch ({} != {})",
                ch.block_size, ph.block_size
            )));
        }

        // The child's size wins, parent blocks past its end are dropped
        let limit = ch.max_blocks();
        let indices = union_indices(parent.indices(), child.indices(), limit);
        let header = ImageHeader {
            uuid: ch.uuid,
            parent: ph.parent,
            block_size: ch.block_size,
            virtual_size: ch.virtual_size,
            block_count: indices.len() as u32,
        };

        let mut prelude = BytesMut::from(&header.encode()[..]);
        prelude.extend_from_slice(&encode_table(&indices));

        Ok(Self {
            header,
            parent,
            child,
            parent_head: None,
            parent_done: false,
            child_head: None,
            child_done: false,
            prelude: Some(prelude.freeze()),
        })
    }

    fn into_stream(self) -> ByteStream {
        Box::pin(futures_util::stream::try_unfold(self, |mut plan| async move {
            match plan.next_chunk().await {
                Ok(Some(chunk)) => Ok(Some((chunk, plan))),
                Ok(None) => Ok(None),
                Err(e) => Err(std::io::Error::other(e)),
            }
        }))
    }

    async fn peek_parent(&mut self) -> Result<Option<u32>> {
        if self.parent_head.is_none() && !self.parent_done {
            self.parent_head = self.parent.next_block().await?;
            self.parent_done = self.parent_head.is_none();
        }
        Ok(self.parent_head.as_ref().map(|(i, _)| *i))
    }

    async fn peek_child(&mut self) -> Result<Option<u32>> {
        if self.child_head.is_none() && !self.child_done {
            self.child_head = self.child.next_block().await?;
            self.child_done = self.child_head.is_none();
        }
        Ok(self.child_head.as_ref().map(|(i, _)| *i))
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(prelude) = self.prelude.take() {
            return Ok(Some(prelude));
        }

        let limit = self.header.max_blocks();
        let parent = self.peek_parent().await?.filter(|&i| (i as u64) < limit);
        let child = self.peek_child().await?;

        let block = match (parent, child) {
            (None, None) => {
                self.finish().await?;
                return Ok(None);
            }
            (Some(p), Some(c)) if c <= p => {
                if c == p {
                    // Overwritten by the child
                    self.parent_head = None;
                }
                self.child_head.take()
            }
            (None, Some(_)) => self.child_head.take(),
            (Some(_), _) => self.parent_head.take(),
        };

        Ok(block.map(|(_, data)| data))
    }

    /// Check both inputs were well formed up to their last byte
    async fn finish(&mut self) -> Result<()> {
        while self.parent.next_block().await?.is_some() {}
        self.parent.finish().await?;
        self.child.finish().await?;
        Ok(())
    }
}

/// Sorted union of two sorted index lists, bounded by `limit`
fn union_indices(parent: &[u32], child: &[u32], limit: u64) -> Vec<u32> {
    let mut out = Vec::with_capacity(parent.len().max(child.len()));
    let (mut i, mut j) = (0, 0);
    while i < parent.len() || j < child.len() {
        let next = match (parent.get(i), child.get(j)) {
            (Some(&p), Some(&c)) if p == c => {
                i += 1;
                j += 1;
                p
            }
            (Some(&p), Some(&c)) if p < c => {
                i += 1;
                p
            }
            (Some(_), Some(&c)) => {
                j += 1;
                c
            }
            (Some(&p), None) => {
                i += 1;
                p
            }
            (None, Some(&c)) => {
                j += 1;
                c
            }
            (None, None) => break,
        };
        if (next as u64) < limit {
            out.push(next);
        }
    }
    out
}

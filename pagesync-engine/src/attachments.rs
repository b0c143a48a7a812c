//! Attachment replication between the two stores.
//!
//! Downloads run concurrently, but the destination store mangles parallel
//! multipart uploads to the same space, so every upload goes through one
//! global lock.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use pagesync_store::{Attachment, ContentStore};

use crate::error::Result;

#[derive(Clone)]
pub struct AttachmentSync {
    upload_lock: Arc<Mutex<()>>,
    max_concurrency: usize,
}

impl AttachmentSync {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            upload_lock: Arc::new(Mutex::new(())),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Copy a page's attachments, skipping those whose destination copy is
    /// at least as recent as the source. Returns the number copied.
    pub async fn sync_page<S: ContentStore>(
        &self,
        source: &S,
        dest: &S,
        source_page_id: &str,
        dest_page_id: &str,
    ) -> Result<usize> {
        let from_source = source.list_attachments(source_page_id).await?;
        let pending = pending_only(dest, dest_page_id, from_source).await?;
        self.copy_all(source, dest, dest_page_id, pending).await
    }

    /// Copy an explicit set of attachments by name, with the same
    /// last-modified gate as [`Self::sync_page`].
    pub async fn copy_named<S: ContentStore>(
        &self,
        source: &S,
        dest: &S,
        source_page_id: &str,
        dest_page_id: &str,
        names: &[String],
    ) -> Result<usize> {
        let attachments = source
            .get_attachments_by_name(source_page_id, names)
            .await?;
        let pending = pending_only(dest, dest_page_id, attachments).await?;
        self.copy_all(source, dest, dest_page_id, pending).await
    }

    async fn copy_all<S: ContentStore>(
        &self,
        source: &S,
        dest: &S,
        dest_page_id: &str,
        attachments: Vec<Attachment>,
    ) -> Result<usize> {
        let count = attachments.len();
        stream::iter(attachments)
            .map(|attachment| self.copy_one(source, dest, dest_page_id, attachment))
            .buffer_unordered(self.max_concurrency)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(count)
    }

    async fn copy_one<S: ContentStore>(
        &self,
        source: &S,
        dest: &S,
        dest_page_id: &str,
        attachment: Attachment,
    ) -> Result<()> {
        let data = source.download_attachment(&attachment.download_url).await?;

        let _guard = self.upload_lock.lock().await;
        dest.attach_content(
            dest_page_id,
            data,
            &attachment.title,
            &attachment.title,
            attachment.comment.as_deref(),
        )
        .await?;
        info!("Copied attachment \"{}\"", attachment.title);
        Ok(())
    }
}

/// Drop attachments whose destination copy is at least as recent.
async fn pending_only<S: ContentStore>(
    dest: &S,
    dest_page_id: &str,
    attachments: Vec<Attachment>,
) -> Result<Vec<Attachment>> {
    if attachments.is_empty() {
        return Ok(attachments);
    }

    let existing: HashMap<String, Attachment> = dest
        .list_attachments(dest_page_id)
        .await?
        .into_iter()
        .map(|a| (a.title.clone(), a))
        .collect();

    Ok(attachments
        .into_iter()
        .filter(|a| match existing.get(&a.title) {
            Some(copy) if copy.last_modified >= a.last_modified => {
                debug!("Attachment \"{}\" already copied", a.title);
                false
            }
            _ => true,
        })
        .collect())
}

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::{Attachment, Page, PageExpand, UpdatePage};

/// Contract of a wiki-style content store.
///
/// Implemented over the REST API by [`crate::RestStore`] and in memory by
/// [`crate::MemoryStore`]. Listing methods collect their paged results to
/// exhaustion before returning.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Look a page up by `(space, title)`. Returns `Ok(None)` when no page
    /// with that title exists in the space.
    async fn get_page_by_title(
        &self,
        space: &str,
        title: &str,
        expand: PageExpand,
    ) -> Result<Option<Page>>;

    async fn get_page_by_id(&self, id: &str, expand: PageExpand) -> Result<Page>;

    async fn get_child_pages(&self, page_id: &str, expand: PageExpand) -> Result<Vec<Page>>;

    async fn create_page(
        &self,
        space: &str,
        title: &str,
        body: &str,
        parent_id: &str,
    ) -> Result<Page>;

    async fn update_page(&self, update: UpdatePage) -> Result<Page>;

    /// Re-parent a page without touching its content.
    async fn move_page(&self, space: &str, page_id: &str, new_parent_id: &str) -> Result<()>;

    /// Whether the page already carries exactly this body and title.
    async fn is_content_already_updated(
        &self,
        page_id: &str,
        body: &str,
        title: &str,
    ) -> Result<bool>;

    /// All descendants of `root_page_id` within `space`, in store order.
    /// The root page itself is not included.
    async fn list_descendant_pages(&self, space: &str, root_page_id: &str) -> Result<Vec<Page>>;

    /// All attachments of a page, with last-modified timestamps.
    async fn list_attachments(&self, page_id: &str) -> Result<Vec<Attachment>>;

    /// Attachments of a page filtered by name.
    async fn get_attachments_by_name(
        &self,
        page_id: &str,
        names: &[String],
    ) -> Result<Vec<Attachment>>;

    /// Upload attachment bytes, creating or updating the attachment.
    async fn attach_content(
        &self,
        page_id: &str,
        content: Bytes,
        title: &str,
        name: &str,
        comment: Option<&str>,
    ) -> Result<()>;

    async fn download_attachment(&self, url: &str) -> Result<Bytes>;

    /// The homepage of a space. Used as the sync root's parent when no
    /// destination title is given.
    async fn get_space_homepage(&self, space: &str) -> Result<Page>;
}

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::store::ContentStore;
use crate::types::{Attachment, Page, PageAncestor, PageExpand, UpdatePage};

/// In-memory [`ContentStore`] used by engine tests and demos.
///
/// Tracks body-update and attachment-upload counters so idempotence and
/// timestamp-gating behavior can be asserted, and supports injecting write
/// failures per page title for fail-fast tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    pages: HashMap<String, MemPage>,
    /// Page ids in creation order; child listings follow this order.
    order: Vec<String>,
    /// Space key -> homepage id.
    spaces: HashMap<String, String>,
    attachments: HashMap<String, Vec<MemAttachment>>,
    body_updates: usize,
    attachment_uploads: usize,
    fail_titles: HashSet<String>,
}

#[derive(Clone)]
struct MemPage {
    id: String,
    space: String,
    title: String,
    body: String,
    parent: Option<String>,
}

#[derive(Clone)]
struct MemAttachment {
    title: String,
    last_modified: DateTime<Utc>,
    data: Bytes,
    comment: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a space with its homepage and return the homepage id.
    pub fn add_space(&self, space: &str, homepage_title: &str) -> String {
        let mut inner = self.inner.lock();
        let id = inner.alloc_id();
        inner.insert_page(MemPage {
            id: id.clone(),
            space: space.to_string(),
            title: homepage_title.to_string(),
            body: String::new(),
            parent: None,
        });
        inner.spaces.insert(space.to_string(), id.clone());
        id
    }

    /// Seed a page directly, bypassing the write counters.
    pub fn add_page(&self, space: &str, title: &str, body: &str, parent_id: &str) -> String {
        let mut inner = self.inner.lock();
        let id = inner.alloc_id();
        inner.insert_page(MemPage {
            id: id.clone(),
            space: space.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            parent: Some(parent_id.to_string()),
        });
        id
    }

    /// Seed an attachment with an explicit timestamp.
    pub fn add_attachment(
        &self,
        page_id: &str,
        title: &str,
        data: Bytes,
        comment: Option<&str>,
        last_modified: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock();
        let list = inner.attachments.entry(page_id.to_string()).or_default();
        list.retain(|a| a.title != title);
        list.push(MemAttachment {
            title: title.to_string(),
            last_modified,
            data,
            comment: comment.map(str::to_string),
        });
    }

    /// Make every create/update of a page with this title fail.
    pub fn fail_writes_for_title(&self, title: &str) {
        self.inner.lock().fail_titles.insert(title.to_string());
    }

    pub fn page_by_title(&self, space: &str, title: &str) -> Option<Page> {
        let inner = self.inner.lock();
        inner
            .find_by_title(space, title)
            .map(|p| inner.to_page(p, PageExpand::full()))
    }

    pub fn body_of(&self, space: &str, title: &str) -> Option<String> {
        let inner = self.inner.lock();
        inner.find_by_title(space, title).map(|p| p.body.clone())
    }

    pub fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Number of `update_page` calls observed so far.
    pub fn body_update_count(&self) -> usize {
        self.inner.lock().body_updates
    }

    /// Number of `attach_content` calls observed so far.
    pub fn attachment_upload_count(&self) -> usize {
        self.inner.lock().attachment_uploads
    }

    pub fn attachment_data(&self, page_id: &str, name: &str) -> Option<Bytes> {
        let inner = self.inner.lock();
        inner
            .attachments
            .get(page_id)
            .and_then(|list| list.iter().find(|a| a.title == name))
            .map(|a| a.data.clone())
    }
}

impl Inner {
    fn alloc_id(&mut self) -> String {
        self.next_id += 1;
        format!("m{}", self.next_id)
    }

    fn insert_page(&mut self, page: MemPage) {
        self.order.push(page.id.clone());
        self.pages.insert(page.id.clone(), page);
    }

    fn find_by_title(&self, space: &str, title: &str) -> Option<&MemPage> {
        self.pages
            .values()
            .find(|p| p.space == space && p.title == title)
    }

    fn ancestors_of(&self, page: &MemPage) -> Vec<PageAncestor> {
        let mut chain = Vec::new();
        let mut cursor = page.parent.clone();
        while let Some(id) = cursor {
            match self.pages.get(&id) {
                Some(parent) => {
                    chain.push(PageAncestor {
                        id: parent.id.clone(),
                        title: parent.title.clone(),
                    });
                    cursor = parent.parent.clone();
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    fn to_page(&self, page: &MemPage, expand: PageExpand) -> Page {
        Page {
            id: page.id.clone(),
            title: page.title.clone(),
            space: page.space.clone(),
            ancestors: if expand.ancestors {
                self.ancestors_of(page)
            } else {
                Vec::new()
            },
            body: expand.body.then(|| page.body.clone()),
        }
    }

    fn check_writable(&self, title: &str) -> Result<()> {
        if self.fail_titles.contains(title) {
            Err(StoreError::Server {
                status: 500,
                message: format!("injected write failure for \"{title}\""),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get_page_by_title(
        &self,
        space: &str,
        title: &str,
        expand: PageExpand,
    ) -> Result<Option<Page>> {
        let inner = self.inner.lock();
        Ok(inner
            .find_by_title(space, title)
            .map(|p| inner.to_page(p, expand)))
    }

    async fn get_page_by_id(&self, id: &str, expand: PageExpand) -> Result<Page> {
        let inner = self.inner.lock();
        inner
            .pages
            .get(id)
            .map(|p| inner.to_page(p, expand))
            .ok_or(StoreError::NotFound)
    }

    async fn get_child_pages(&self, page_id: &str, expand: PageExpand) -> Result<Vec<Page>> {
        let inner = self.inner.lock();
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.pages.get(id))
            .filter(|p| p.parent.as_deref() == Some(page_id))
            .map(|p| inner.to_page(p, expand))
            .collect())
    }

    async fn create_page(
        &self,
        space: &str,
        title: &str,
        body: &str,
        parent_id: &str,
    ) -> Result<Page> {
        let mut inner = self.inner.lock();
        inner.check_writable(title)?;

        if inner.find_by_title(space, title).is_some() {
            return Err(StoreError::Server {
                status: 400,
                message: format!("page \"{title}\" already exists in space \"{space}\""),
            });
        }
        if !inner.pages.contains_key(parent_id) {
            return Err(StoreError::NotFound);
        }

        let id = inner.alloc_id();
        let page = MemPage {
            id,
            space: space.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            parent: Some(parent_id.to_string()),
        };
        let result = inner.to_page(&page, PageExpand::full());
        inner.insert_page(page);
        Ok(result)
    }

    async fn update_page(&self, update: UpdatePage) -> Result<Page> {
        let mut inner = self.inner.lock();
        inner.check_writable(&update.title)?;

        let page = inner.pages.get(&update.id).ok_or(StoreError::NotFound)?;
        let mut page = page.clone();
        page.title = update.title;
        page.body = update.body;
        if let Some(parent) = update.parent_id {
            page.parent = Some(parent);
        }
        inner.pages.insert(page.id.clone(), page.clone());
        inner.body_updates += 1;

        Ok(inner.to_page(&page, PageExpand::full()))
    }

    async fn move_page(&self, _space: &str, page_id: &str, new_parent_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let page = inner.pages.get_mut(page_id).ok_or(StoreError::NotFound)?;
        page.parent = Some(new_parent_id.to_string());
        Ok(())
    }

    async fn is_content_already_updated(
        &self,
        page_id: &str,
        body: &str,
        title: &str,
    ) -> Result<bool> {
        let inner = self.inner.lock();
        let page = inner.pages.get(page_id).ok_or(StoreError::NotFound)?;
        Ok(page.body == body && page.title == title)
    }

    async fn list_descendant_pages(&self, space: &str, root_page_id: &str) -> Result<Vec<Page>> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        let mut frontier = vec![root_page_id.to_string()];

        while let Some(parent) = frontier.pop() {
            for id in &inner.order {
                let page = &inner.pages[id];
                if page.space == space && page.parent.as_deref() == Some(parent.as_str()) {
                    out.push(inner.to_page(page, PageExpand::none()));
                    frontier.push(page.id.clone());
                }
            }
        }

        Ok(out)
    }

    async fn list_attachments(&self, page_id: &str) -> Result<Vec<Attachment>> {
        let inner = self.inner.lock();
        Ok(inner
            .attachments
            .get(page_id)
            .map(|list| {
                list.iter()
                    .map(|a| Attachment {
                        title: a.title.clone(),
                        last_modified: a.last_modified,
                        download_url: format!("mem://{page_id}/{}", a.title),
                        comment: a.comment.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_attachments_by_name(
        &self,
        page_id: &str,
        names: &[String],
    ) -> Result<Vec<Attachment>> {
        let all = self.list_attachments(page_id).await?;
        Ok(all
            .into_iter()
            .filter(|a| names.contains(&a.title))
            .collect())
    }

    async fn attach_content(
        &self,
        page_id: &str,
        content: Bytes,
        title: &str,
        _name: &str,
        comment: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.pages.contains_key(page_id) {
            return Err(StoreError::NotFound);
        }

        let attachment = MemAttachment {
            title: title.to_string(),
            last_modified: Utc::now(),
            data: content,
            comment: comment.map(str::to_string),
        };
        let list = inner.attachments.entry(page_id.to_string()).or_default();
        list.retain(|a| a.title != title);
        list.push(attachment);
        inner.attachment_uploads += 1;
        Ok(())
    }

    async fn download_attachment(&self, url: &str) -> Result<Bytes> {
        let rest = url.strip_prefix("mem://").ok_or(StoreError::NotFound)?;
        let (page_id, name) = rest.split_once('/').ok_or(StoreError::NotFound)?;
        self.attachment_data(page_id, name).ok_or(StoreError::NotFound)
    }

    async fn get_space_homepage(&self, space: &str) -> Result<Page> {
        let inner = self.inner.lock();
        let id = inner.spaces.get(space).ok_or(StoreError::NotFound)?;
        let page = &inner.pages[id];
        Ok(inner.to_page(page, PageExpand::none()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_page_lifecycle() {
        let store = MemoryStore::new();
        let home = store.add_space("S", "Home");

        let root = store
            .create_page("S", "Root", "<p>root</p>", &home)
            .await
            .unwrap();
        let child = store
            .create_page("S", "Child", "<p>child</p>", &root.id)
            .await
            .unwrap();

        let fetched = store
            .get_page_by_id(&child.id, PageExpand::full())
            .await
            .unwrap();
        assert_eq!(fetched.parent_id(), Some(root.id.as_str()));
        assert_eq!(fetched.ancestors[0].title, "Home");
        assert_eq!(fetched.body.as_deref(), Some("<p>child</p>"));

        let descendants = store.list_descendant_pages("S", &home).await.unwrap();
        assert_eq!(descendants.len(), 2);
    }

    #[tokio::test]
    async fn test_update_counts_and_move() {
        let store = MemoryStore::new();
        let home = store.add_space("S", "Home");
        let a = store.create_page("S", "A", "x", &home).await.unwrap();
        let b = store.create_page("S", "B", "y", &home).await.unwrap();

        assert_eq!(store.body_update_count(), 0);
        store
            .update_page(UpdatePage::new(&a.id, "A", "z"))
            .await
            .unwrap();
        assert_eq!(store.body_update_count(), 1);

        store.move_page("S", &a.id, &b.id).await.unwrap();
        let moved = store
            .get_page_by_id(&a.id, PageExpand::ancestors())
            .await
            .unwrap();
        assert_eq!(moved.parent_id(), Some(b.id.as_str()));
    }

    #[tokio::test]
    async fn test_attachment_roundtrip() {
        let store = MemoryStore::new();
        let home = store.add_space("S", "Home");
        store
            .attach_content(&home, Bytes::from_static(b"img"), "a.png", "a.png", None)
            .await
            .unwrap();

        let listed = store.list_attachments(&home).await.unwrap();
        assert_eq!(listed.len(), 1);
        let data = store
            .download_attachment(&listed[0].download_url)
            .await
            .unwrap();
        assert_eq!(&data[..], b"img");
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        let home = store.add_space("S", "Home");
        store.fail_writes_for_title("Broken");

        let err = store
            .create_page("S", "Broken", "x", &home)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Server { status: 500, .. }));
    }
}

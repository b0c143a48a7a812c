use backoff::{future::retry, ExponentialBackoff};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{ClientBuilder, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use async_trait::async_trait;

use crate::error::{Result, StoreError};
use crate::store::ContentStore;
use crate::types::{Attachment, Page, PageAncestor, PageExpand, UpdatePage};

const PAGE_SIZE: usize = 50;

/// Credentials applied to every request.
#[derive(Debug, Clone)]
pub enum Auth {
    Basic { username: String, password: String },
    Token(String),
}

impl Auth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::Token(token) => request.bearer_auth(token),
        }
    }
}

/// REST implementation of [`ContentStore`].
///
/// Read-only calls retry transient failures with exponential backoff.
/// Mutating calls are never retried: a failed write aborts the sync and
/// re-running it is the documented recovery path.
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    auth: Auth,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, auth: Auth) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        // Build HTTP client with reasonable defaults
        let client = ClientBuilder::new()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("pagesync/0.1.0")
            .build()
            .map_err(StoreError::Network)?;

        Ok(Self {
            client,
            base_url,
            auth,
        })
    }

    pub fn with_client(base_url: impl Into<String>, auth: Auth, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn content_url(&self, tail: &str) -> String {
        format!("{}/rest/api/content{}", self.base_url, tail)
    }

    /// Expand parameter for page fetches. Space and version are always
    /// expanded since `Page` carries the space key and updates need the
    /// current version number.
    fn page_expand(expand: PageExpand) -> String {
        match expand.as_query() {
            Some(extra) => format!("space,version,{extra}"),
            None => "space,version".to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let request = self.auth.apply(self.client.get(url).query(query));
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    /// One page of a paged listing endpoint.
    async fn get_page_of<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        start: usize,
    ) -> Result<RestList<T>> {
        let start = start.to_string();
        let limit = PAGE_SIZE.to_string();
        let mut query: Vec<(&str, &str)> = query.to_vec();
        query.push(("start", &start));
        query.push(("limit", &limit));
        self.get_json(url, &query).await
    }

    /// Walk a paged listing to exhaustion by following the `_links.next`
    /// cursor. Servers may clamp the requested limit, so the response
    /// size says nothing about whether more pages exist.
    async fn get_all<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut all = Vec::new();
        let mut page: RestList<T> = self.get_page_of(url, query, 0).await?;

        loop {
            let RestList { results, links } = page;
            if results.is_empty() {
                break;
            }
            all.extend(results);

            match links.next {
                Some(next) => {
                    let next_url = format!("{}{}", self.base_url, next);
                    page = self.get_json(&next_url, &[]).await?;
                }
                None => break,
            }
        }

        Ok(all)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            let content: T = response.json().await?;
            Ok(content)
        } else {
            Err(Self::parse_error_response(response).await)
        }
    }

    async fn parse_error_response(response: reqwest::Response) -> StoreError {
        let status = response.status();

        match status {
            StatusCode::UNAUTHORIZED => StoreError::Authentication("Unauthorized".to_string()),
            StatusCode::FORBIDDEN => StoreError::PermissionDenied("Forbidden".to_string()),
            StatusCode::NOT_FOUND => StoreError::NotFound,
            status if status.is_client_error() || status.is_server_error() => {
                let message = response.text().await.unwrap_or_default();
                StoreError::Server {
                    status: status.as_u16(),
                    message,
                }
            }
            _ => {
                let message = response.text().await.unwrap_or_default();
                StoreError::Unknown(message)
            }
        }
    }

    /// Retry wrapper for read-only operations.
    async fn retry_read<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        retry(backoff, || async {
            match operation().await {
                Ok(result) => Ok(result),
                Err(error) => {
                    if error.is_retryable() {
                        warn!("Retryable error occurred: {}", error);
                        Err(backoff::Error::transient(error))
                    } else {
                        debug!("Non-retryable error: {}", error);
                        Err(backoff::Error::permanent(error))
                    }
                }
            }
        })
        .await
    }

    async fn fetch_page_by_id(&self, id: &str, expand: PageExpand) -> Result<RestPage> {
        let url = self.content_url(&format!("/{id}"));
        let expand = Self::page_expand(expand);
        self.get_json(&url, &[("expand", expand.as_str())]).await
    }

    /// Existing attachment id for a file name, if any. Needed because the
    /// create endpoint rejects duplicate names.
    async fn find_attachment_id(&self, page_id: &str, name: &str) -> Result<Option<String>> {
        let url = self.content_url(&format!("/{page_id}/child/attachment"));
        let attachments: Vec<RestAttachment> =
            self.get_all(&url, &[("filename", name)]).await?;
        Ok(attachments.into_iter().next().map(|a| a.id))
    }

    fn attachment_form(content: Bytes, name: &str, comment: Option<&str>) -> reqwest::multipart::Form {
        let part = reqwest::multipart::Part::bytes(content.to_vec()).file_name(name.to_string());
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("minorEdit", "true");
        if let Some(comment) = comment {
            form = form.text("comment", comment.to_string());
        }
        form
    }
}

#[async_trait]
impl ContentStore for RestStore {
    async fn get_page_by_title(
        &self,
        space: &str,
        title: &str,
        expand: PageExpand,
    ) -> Result<Option<Page>> {
        self.retry_read(|| async {
            let url = self.content_url("");
            let expand = Self::page_expand(expand);
            let list: RestList<RestPage> = self
                .get_json(
                    &url,
                    &[
                        ("spaceKey", space),
                        ("title", title),
                        ("expand", expand.as_str()),
                    ],
                )
                .await?;

            Ok(list.results.into_iter().next().map(|p| p.into_page(space)))
        })
        .await
    }

    async fn get_page_by_id(&self, id: &str, expand: PageExpand) -> Result<Page> {
        self.retry_read(|| async {
            let page = self.fetch_page_by_id(id, expand).await?;
            Ok(page.into_page(""))
        })
        .await
    }

    async fn get_child_pages(&self, page_id: &str, expand: PageExpand) -> Result<Vec<Page>> {
        self.retry_read(|| async {
            let url = self.content_url(&format!("/{page_id}/child/page"));
            let expand = Self::page_expand(expand);
            let pages: Vec<RestPage> = self.get_all(&url, &[("expand", expand.as_str())]).await?;
            Ok(pages.into_iter().map(|p| p.into_page("")).collect())
        })
        .await
    }

    async fn create_page(
        &self,
        space: &str,
        title: &str,
        body: &str,
        parent_id: &str,
    ) -> Result<Page> {
        let url = self.content_url("");
        let payload = CreatePagePayload::new(space, title, body, parent_id);

        let request = self.auth.apply(self.client.post(&url).json(&payload));
        let response = request.send().await?;
        let page: RestPage = Self::handle_response(response).await?;

        Ok(page.into_page(space))
    }

    async fn update_page(&self, update: UpdatePage) -> Result<Page> {
        // The store requires the next version number in the update payload.
        let current = self.fetch_page_by_id(&update.id, PageExpand::none()).await?;
        let next_version = current.version.map(|v| v.number).unwrap_or(1) + 1;

        let url = self.content_url(&format!("/{}", update.id));
        let payload = UpdatePagePayload::new(&update, next_version);

        let request = self.auth.apply(self.client.put(&url).json(&payload));
        let response = request.send().await?;
        let page: RestPage = Self::handle_response(response).await?;

        Ok(page.into_page(""))
    }

    async fn move_page(&self, _space: &str, page_id: &str, new_parent_id: &str) -> Result<()> {
        let url = self.content_url(&format!("/{page_id}/move/append/{new_parent_id}"));

        let request = self.auth.apply(self.client.put(&url));
        let response = request.send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::parse_error_response(response).await)
        }
    }

    async fn is_content_already_updated(
        &self,
        page_id: &str,
        body: &str,
        title: &str,
    ) -> Result<bool> {
        let page = self.get_page_by_id(page_id, PageExpand::body()).await?;
        Ok(page.title == title && page.body.as_deref() == Some(body))
    }

    async fn list_descendant_pages(&self, space: &str, root_page_id: &str) -> Result<Vec<Page>> {
        self.retry_read(|| async {
            let url = format!("{}/rest/api/content/search", self.base_url);
            let cql = format!("(space=\"{space}\" and ancestor={root_page_id})");
            let params = SearchParams {
                cql: &cql,
                expand: "space,version",
            };
            let query = serde_urlencoded::to_string(&params)
                .map_err(|e| StoreError::Unknown(e.to_string()))?;
            let url = format!("{url}?{query}");

            let pages: Vec<RestPage> = self.get_all(&url, &[]).await?;
            Ok(pages.into_iter().map(|p| p.into_page(space)).collect())
        })
        .await
    }

    async fn list_attachments(&self, page_id: &str) -> Result<Vec<Attachment>> {
        self.retry_read(|| async {
            let url = self.content_url(&format!("/{page_id}/child/attachment"));
            let attachments: Vec<RestAttachment> = self
                .get_all(&url, &[("expand", "history.lastUpdated,metadata")])
                .await?;
            Ok(attachments.into_iter().map(|a| a.into_attachment()).collect())
        })
        .await
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
        _title: &str,
        name: &str,
        comment: Option<&str>,
    ) -> Result<()> {
        // Duplicate names must go through the per-attachment data endpoint.
        let url = match self.find_attachment_id(page_id, name).await? {
            Some(attachment_id) => {
                self.content_url(&format!("/{page_id}/child/attachment/{attachment_id}/data"))
            }
            None => self.content_url(&format!("/{page_id}/child/attachment")),
        };

        let form = Self::attachment_form(content, name, comment);
        let request = self.auth.apply(
            self.client
                .post(&url)
                .header("X-Atlassian-Token", "no-check")
                .multipart(form),
        );
        let response = request.send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::parse_error_response(response).await)
        }
    }

    async fn download_attachment(&self, url: &str) -> Result<Bytes> {
        self.retry_read(|| async {
            // Download links come back host-relative.
            let absolute = if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("{}/{}", self.base_url, url.trim_start_matches('/'))
            };

            let request = self.auth.apply(self.client.get(&absolute));
            let response = request.send().await?;

            if response.status().is_success() {
                Ok(response.bytes().await?)
            } else {
                Err(Self::parse_error_response(response).await)
            }
        })
        .await
    }

    async fn get_space_homepage(&self, space: &str) -> Result<Page> {
        let space_data: RestSpaceDetail = self
            .retry_read(|| async {
                let url = format!("{}/rest/api/space/{}", self.base_url, space);
                self.get_json(&url, &[("expand", "homepage")]).await
            })
            .await?;

        let homepage = space_data.homepage.ok_or(StoreError::NotFound)?;
        self.get_page_by_id(&homepage.id, PageExpand::none()).await
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct SearchParams<'a> {
    cql: &'a str,
    expand: &'a str,
}

#[derive(Debug, Deserialize)]
struct RestList<T> {
    results: Vec<T>,
    #[serde(rename = "_links", default)]
    links: ListLinks,
}

#[derive(Debug, Default, Deserialize)]
struct ListLinks {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestPage {
    id: String,
    title: String,
    #[serde(default)]
    space: Option<RestSpaceRef>,
    #[serde(default)]
    ancestors: Option<Vec<RestAncestor>>,
    #[serde(default)]
    body: Option<RestBody>,
    #[serde(default)]
    version: Option<RestVersion>,
}

impl RestPage {
    fn into_page(self, fallback_space: &str) -> Page {
        Page {
            id: self.id,
            title: self.title,
            space: self
                .space
                .map(|s| s.key)
                .unwrap_or_else(|| fallback_space.to_string()),
            ancestors: self
                .ancestors
                .unwrap_or_default()
                .into_iter()
                .map(|a| PageAncestor {
                    id: a.id,
                    title: a.title.unwrap_or_default(),
                })
                .collect(),
            body: self.body.and_then(|b| b.storage).map(|s| s.value),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RestSpaceRef {
    key: String,
}

#[derive(Debug, Deserialize)]
struct RestAncestor {
    id: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestBody {
    #[serde(default)]
    storage: Option<RestStorage>,
}

#[derive(Debug, Deserialize)]
struct RestStorage {
    value: String,
}

#[derive(Debug, Deserialize)]
struct RestVersion {
    number: u32,
}

#[derive(Debug, Deserialize)]
struct RestSpaceDetail {
    #[serde(default)]
    homepage: Option<RestHomepage>,
}

#[derive(Debug, Deserialize)]
struct RestHomepage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RestAttachment {
    id: String,
    title: String,
    #[serde(default)]
    metadata: Option<RestAttachmentMetadata>,
    #[serde(default)]
    history: Option<RestHistory>,
    #[serde(rename = "_links")]
    links: RestLinks,
}

impl RestAttachment {
    fn into_attachment(self) -> Attachment {
        Attachment {
            title: self.title,
            last_modified: self
                .history
                .and_then(|h| h.last_updated)
                .map(|w| w.when)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            download_url: self.links.download,
            comment: self.metadata.and_then(|m| m.comment),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RestAttachmentMetadata {
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestHistory {
    #[serde(rename = "lastUpdated")]
    last_updated: Option<RestWhen>,
}

#[derive(Debug, Deserialize)]
struct RestWhen {
    when: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RestLinks {
    download: String,
}

#[derive(Debug, Serialize)]
struct CreatePagePayload<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    title: &'a str,
    space: SpaceKeyPayload<'a>,
    ancestors: Vec<AncestorPayload<'a>>,
    body: BodyPayload<'a>,
}

impl<'a> CreatePagePayload<'a> {
    fn new(space: &'a str, title: &'a str, body: &'a str, parent_id: &'a str) -> Self {
        Self {
            content_type: "page",
            title,
            space: SpaceKeyPayload { key: space },
            ancestors: vec![AncestorPayload { id: parent_id }],
            body: BodyPayload::storage(body),
        }
    }
}

#[derive(Debug, Serialize)]
struct UpdatePagePayload<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    title: &'a str,
    version: VersionPayload<'a>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ancestors: Vec<AncestorPayload<'a>>,
    body: BodyPayload<'a>,
}

impl<'a> UpdatePagePayload<'a> {
    fn new(update: &'a UpdatePage, next_version: u32) -> Self {
        Self {
            content_type: "page",
            title: &update.title,
            version: VersionPayload {
                number: next_version,
                message: update.version_comment.as_deref(),
            },
            ancestors: update
                .parent_id
                .as_deref()
                .map(|id| vec![AncestorPayload { id }])
                .unwrap_or_default(),
            body: BodyPayload::storage(&update.body),
        }
    }
}

#[derive(Debug, Serialize)]
struct SpaceKeyPayload<'a> {
    key: &'a str,
}

#[derive(Debug, Serialize)]
struct AncestorPayload<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct VersionPayload<'a> {
    number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct BodyPayload<'a> {
    storage: StoragePayload<'a>,
}

impl<'a> BodyPayload<'a> {
    fn storage(value: &'a str) -> Self {
        Self {
            storage: StoragePayload {
                value,
                representation: "storage",
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct StoragePayload<'a> {
    value: &'a str,
    representation: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_creation() {
        let store = RestStore::new(
            "https://wiki.example.com/",
            Auth::Token("secret".to_string()),
        );
        assert!(store.is_ok());
        assert_eq!(store.unwrap().base_url, "https://wiki.example.com");
    }

    #[test]
    fn test_create_payload_shape() {
        let payload = CreatePagePayload::new("DST", "Title", "<p>x</p>", "42");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "page");
        assert_eq!(json["space"]["key"], "DST");
        assert_eq!(json["ancestors"][0]["id"], "42");
        assert_eq!(json["body"]["storage"]["representation"], "storage");
    }

    #[test]
    fn test_paged_list_next_cursor() {
        // A clamped page can come back smaller than the requested limit,
        // so pagination keys off the next link, not the result count.
        let raw = r#"{
            "results": [{"id": "1", "title": "A"}],
            "size": 1,
            "_links": {"next": "/rest/api/content/1/child/page?limit=25&start=25"}
        }"#;
        let list: RestList<RestPage> = serde_json::from_str(raw).unwrap();
        assert_eq!(list.results.len(), 1);
        assert_eq!(
            list.links.next.as_deref(),
            Some("/rest/api/content/1/child/page?limit=25&start=25")
        );

        let last: RestList<RestPage> = serde_json::from_str(r#"{"results": []}"#).unwrap();
        assert!(last.links.next.is_none());
    }

    #[test]
    fn test_attachment_parse() {
        let raw = r#"{
            "id": "att1",
            "title": "diagram.png",
            "metadata": {"comment": "first upload"},
            "history": {"lastUpdated": {"when": "2024-03-01T10:00:00Z"}},
            "_links": {"download": "/download/attachments/1/diagram.png"}
        }"#;
        let parsed: RestAttachment = serde_json::from_str(raw).unwrap();
        let attachment = parsed.into_attachment();
        assert_eq!(attachment.title, "diagram.png");
        assert_eq!(attachment.comment.as_deref(), Some("first upload"));
        assert_eq!(
            attachment.download_url,
            "/download/attachments/1/diagram.png"
        );
    }
}

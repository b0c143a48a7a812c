use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A page as seen by the sync engine.
///
/// `ancestors` is ordered root-first: the first entry is the space homepage,
/// the last entry is the direct parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub title: String,
    pub space: String,
    #[serde(default)]
    pub ancestors: Vec<PageAncestor>,
    pub body: Option<String>,
}

impl Page {
    /// Direct parent id, if the ancestor chain was fetched and is non-empty.
    pub fn parent_id(&self) -> Option<&str> {
        self.ancestors.last().map(|a| a.id.as_str())
    }
}

/// One entry of a page's ancestor chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageAncestor {
    pub id: String,
    pub title: String,
}

/// A binary attachment of a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub title: String,
    #[serde(rename = "lastModified")]
    pub last_modified: DateTime<Utc>,
    #[serde(rename = "downloadUrl")]
    pub download_url: String,
    pub comment: Option<String>,
}

/// Which expensive page fields to fetch alongside the core record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageExpand {
    pub body: bool,
    pub ancestors: bool,
}

impl PageExpand {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn body() -> Self {
        Self {
            body: true,
            ancestors: false,
        }
    }

    pub fn ancestors() -> Self {
        Self {
            body: false,
            ancestors: true,
        }
    }

    pub fn full() -> Self {
        Self {
            body: true,
            ancestors: true,
        }
    }

    /// Query-string value for the REST API, `None` when nothing is expanded.
    pub fn as_query(&self) -> Option<String> {
        let mut parts = Vec::new();
        if self.body {
            parts.push("body.storage");
        }
        if self.ancestors {
            parts.push("ancestors");
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(","))
        }
    }
}

/// Parameters for a page update.
#[derive(Debug, Clone, Default)]
pub struct UpdatePage {
    pub id: String,
    pub title: String,
    pub body: String,
    pub parent_id: Option<String>,
    pub version_comment: Option<String>,
}

impl UpdatePage {
    pub fn new(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            parent_id: None,
            version_comment: None,
        }
    }

    pub fn parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn version_comment(mut self, comment: impl Into<String>) -> Self {
        self.version_comment = Some(comment.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_query() {
        assert_eq!(PageExpand::none().as_query(), None);
        assert_eq!(PageExpand::body().as_query().as_deref(), Some("body.storage"));
        assert_eq!(
            PageExpand::full().as_query().as_deref(),
            Some("body.storage,ancestors")
        );
    }

    #[test]
    fn test_parent_id() {
        let page = Page {
            id: "3".into(),
            title: "Leaf".into(),
            space: "S".into(),
            ancestors: vec![
                PageAncestor {
                    id: "1".into(),
                    title: "Home".into(),
                },
                PageAncestor {
                    id: "2".into(),
                    title: "Mid".into(),
                },
            ],
            body: None,
        };
        assert_eq!(page.parent_id(), Some("2"));
    }
}

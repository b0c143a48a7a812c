//! Parameters of one synchronization run.

/// What to sync and how to rewrite it.
#[derive(Debug, Clone)]
pub struct SyncParams {
    /// Space holding the hierarchy to copy.
    pub source_space: String,
    /// Title of the hierarchy root.
    pub source_title: String,
    /// Space the copy is written into.
    pub dest_space: String,
    /// Existing destination page to copy the root under; the space
    /// homepage when absent.
    pub dest_title: Option<String>,
    /// Also replicate referenced pages outside the hierarchy, with
    /// space-qualified titles.
    pub sync_out_hierarchy: bool,
    /// `(old, new)` substring replacement applied to every copied title.
    pub replace_title_substr: Option<(String, String)>,
    /// Literal prefix prepended to every copied title.
    pub start_title_with: Option<String>,
    /// Concurrent page tasks per hierarchy level.
    pub max_concurrency: usize,
}

impl SyncParams {
    pub fn new(
        source_space: impl Into<String>,
        source_title: impl Into<String>,
        dest_space: impl Into<String>,
    ) -> Self {
        Self {
            source_space: source_space.into(),
            source_title: source_title.into(),
            dest_space: dest_space.into(),
            dest_title: None,
            sync_out_hierarchy: false,
            replace_title_substr: None,
            start_title_with: None,
            max_concurrency: 8,
        }
    }

    pub fn dest_title(mut self, title: impl Into<String>) -> Self {
        self.dest_title = Some(title.into());
        self
    }

    pub fn sync_out_hierarchy(mut self, enabled: bool) -> Self {
        self.sync_out_hierarchy = enabled;
        self
    }

    pub fn replace_title_substr(
        mut self,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        self.replace_title_substr = Some((old.into(), new.into()));
        self
    }

    pub fn start_title_with(mut self, prefix: impl Into<String>) -> Self {
        self.start_title_with = Some(prefix.into());
        self
    }

    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }
}

//! Dependency forest of out-of-hierarchy pages.
//!
//! References collected during the main pass are resolved into per-space
//! trees: each referenced page with its ancestor chain up to (but not
//! including) the space homepage. Ancestors that were never referenced
//! themselves become placeholder nodes, replicated later as empty pages
//! that only preserve the hierarchy.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, warn};

use pagesync_store::{ContentStore, PageExpand};

use crate::error::Result;
use crate::fmt::{format_page, OutHierarchyCollector, PageCtx, TagFormatter};
use crate::index::{PageIndex, PageRecord};

/// Node index within one space tree.
pub type ForestNodeId = usize;

#[derive(Debug)]
pub struct ForestNode {
    pub title: String,
    /// An ancestor no reference points at; replicated as an empty page.
    pub placeholder: bool,
    children: Vec<ForestNodeId>,
}

#[derive(Debug, Default)]
struct SpaceTree {
    nodes: Vec<ForestNode>,
    /// Titles are unique within a space.
    by_title: HashMap<String, ForestNodeId>,
    roots: Vec<ForestNodeId>,
}

impl SpaceTree {
    /// Existing node by title, or a new one attached under `parent`
    /// (`None` attaches at the root).
    fn get_or_insert(
        &mut self,
        title: &str,
        parent: Option<ForestNodeId>,
        placeholder: bool,
    ) -> ForestNodeId {
        if let Some(&id) = self.by_title.get(title) {
            if !placeholder {
                self.nodes[id].placeholder = false;
            }
            return id;
        }

        let id = self.nodes.len();
        self.nodes.push(ForestNode {
            title: title.to_string(),
            placeholder,
            children: Vec::new(),
        });
        self.by_title.insert(title.to_string(), id);
        match parent {
            Some(parent) => self.nodes[parent].children.push(id),
            None => self.roots.push(id),
        }
        id
    }
}

/// Per-space trees, ordered by space key for a reproducible walk.
#[derive(Debug, Default)]
pub struct DependencyForest {
    trees: BTreeMap<String, SpaceTree>,
}

impl DependencyForest {
    /// Insert a page with its ancestor chain, root-first. Ancestors are
    /// placeholders unless already present as real pages; the leaf is
    /// always a real page, promoted if it was a placeholder before.
    fn insert_chain(&mut self, space: &str, ancestors: &[&str], title: &str) {
        let tree = self.trees.entry(space.to_string()).or_default();
        let mut parent = None;
        for ancestor in ancestors {
            parent = Some(tree.get_or_insert(ancestor, parent, true));
        }
        tree.get_or_insert(title, parent, false);
    }

    fn is_real_page(&self, space: &str, title: &str) -> bool {
        self.trees
            .get(space)
            .and_then(|tree| tree.by_title.get(title))
            .map(|&id| !self.trees[space].nodes[id].placeholder)
            .unwrap_or(false)
    }

    pub fn spaces(&self) -> impl Iterator<Item = &str> {
        self.trees.keys().map(String::as_str)
    }

    pub fn roots(&self, space: &str) -> &[ForestNodeId] {
        self.trees.get(space).map(|t| t.roots.as_slice()).unwrap_or(&[])
    }

    pub fn children(&self, space: &str, id: ForestNodeId) -> &[ForestNodeId] {
        &self.trees[space].nodes[id].children
    }

    pub fn node(&self, space: &str, id: ForestNodeId) -> &ForestNode {
        &self.trees[space].nodes[id]
    }

    /// Total node count, placeholders included; every node becomes one
    /// destination page.
    pub fn page_count(&self) -> usize {
        self.trees.values().map(|t| t.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}

/// Resolve collected references into a [`DependencyForest`].
///
/// Every discovered page is fetched with its ancestors and body; its body
/// is scanned for further external references, so the discovery is
/// transitive. Unresolvable references (gone or not readable) are logged
/// and skipped, they never fail the run.
pub async fn build_forest<S: ContentStore>(
    source: &S,
    index: &PageIndex,
    collector: &Arc<OutHierarchyCollector>,
) -> Result<DependencyForest> {
    let mut forest = DependencyForest::default();
    let mut queue: VecDeque<(String, String)> = collector.drain().into();

    while let Some((space, title)) = queue.pop_front() {
        if forest.is_real_page(&space, &title) {
            continue;
        }

        let page = match source
            .get_page_by_title(&space, &title, PageExpand::full())
            .await
        {
            Ok(Some(page)) => page,
            Ok(None) => {
                warn!("Referenced page \"{title}\" not found in space \"{space}\", skipping");
                continue;
            }
            Err(err) if err.is_skippable_reference() => {
                error!("Cannot resolve referenced page \"{title}\" in space \"{space}\": {err}");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        // The first ancestor is the space homepage, which is never copied.
        let ancestors: Vec<&str> = page
            .ancestors
            .iter()
            .skip(1)
            .map(|a| a.title.as_str())
            .collect();
        forest.insert_chain(&page.space, &ancestors, &page.title);
        debug!(
            "Added \"{}\" to the dependency forest of space \"{}\"",
            page.title, page.space
        );

        if index.search_by_id(&page.id).is_none() {
            index.add_page(PageRecord::new(&page.id, &page.space, &page.title))?;
        }

        if let Some(body) = &page.body {
            let ctx = PageCtx {
                source_id: page.id.clone(),
                source_space: page.space.clone(),
                source_title: page.title.clone(),
            };
            format_page(
                &ctx,
                body,
                &[TagFormatter::OutHierarchyCollect(collector.clone())],
            )?;
            queue.extend(collector.drain());
        }
    }

    Ok(forest)
}

//! Deferred cross-reference resolution for included diagrams.
//!
//! An inclusion macro renders a diagram owned by another page. During the
//! main formatting pass the referenced page's destination id is often not
//! known yet (forward reference within the hierarchy) or will never exist
//! (reference to a page outside the hierarchy). Such references are recorded
//! per owning page and resolved in a second pass after replication finishes:
//! in-hierarchy targets get their new id substituted; out-of-hierarchy
//! diagrams are copied into the owning page once and shared by every later
//! reference through the replacement map.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use pagesync_store::{ContentStore, PageExpand};

use crate::error::{Result, SyncError};
use crate::fmt::{PageCtx, MACRO_TAG};
use crate::index::{PageIndex, PageRecord};
use crate::storage::{NodeId, Tree};

pub const NAME_ATTR: &str = "ac:name";
pub const MACRO_ID_ATTR: &str = "ac:macro-id";
pub const PARAMETER_TAG: &str = "ac:parameter";

pub const INCLUSION_MACRO: &str = "inc-drawio";
pub const DIAGRAM_MACRO: &str = "drawio";

pub const PAGE_ID_PARAM: &str = "pageId";
pub const DIAGRAM_NAME_PARAM: &str = "diagramName";
pub const INCLUDED_PARAM: &str = "includedDiagram";
/// Attachment version numbers do not survive the copy, so this parameter is
/// dropped when a diagram is copied.
pub const REVISION_PARAM: &str = "revision";

/// Version comment for the deferred-fix page updates.
pub const FIX_COMMENT: &str = "Fix links of included diagrams";

/// A diagram inclusion whose target id could not be resolved inline.
#[derive(Debug, Clone)]
pub struct DelayedDiagramRef {
    pub macro_id: String,
    pub ref_page_id: String,
    pub diagram_name: String,
}

/// Attachments a fixed page still needs: referenced source page id to the
/// diagram names owned by it.
pub type RequiredAttachments = Vec<(String, Vec<String>)>;

/// The computed fix for one owning page.
#[derive(Debug)]
pub struct PageFix {
    pub body: String,
    pub attachments: RequiredAttachments,
}

/// Shared state of the two-phase resolver. All maps are mutated from
/// concurrent page tasks and are lock-guarded.
pub struct DeferredResolver {
    index: Arc<PageIndex>,
    /// Owning page source id -> unresolved references in its body.
    delayed: Mutex<HashMap<String, Vec<DelayedDiagramRef>>>,
    /// Out-of-hierarchy source page id -> destination page id that now
    /// carries its diagram.
    replacements: Mutex<HashMap<String, String>>,
    /// Parsed content trees of external source pages, keyed by page id.
    root_cache: Mutex<HashMap<String, Arc<Tree>>>,
}

impl DeferredResolver {
    pub fn new(index: Arc<PageIndex>) -> Self {
        Self {
            index,
            delayed: Mutex::new(HashMap::new()),
            replacements: Mutex::new(HashMap::new()),
            root_cache: Mutex::new(HashMap::new()),
        }
    }

    /// First-pass formatter entry: substitute inline if the target's
    /// destination id is already known, otherwise record a delayed
    /// reference under the owning page.
    pub fn format_inclusion(&self, page: &PageCtx, tree: &mut Tree, el: NodeId) {
        if tree.attr(el, NAME_ATTR).as_deref() != Some(INCLUSION_MACRO) {
            return;
        }
        let included = find_param(tree, el, INCLUDED_PARAM)
            .map(|p| tree.text(p) == "1")
            .unwrap_or(false);
        if !included {
            return;
        }

        let Some(page_id_param) = find_param(tree, el, PAGE_ID_PARAM) else {
            warn!(
                "Inclusion macro without a pageId parameter, page: \"{}\"",
                page.source_title
            );
            return;
        };

        if self.try_substitute(tree, page_id_param) {
            return;
        }

        let (Some(macro_id), Some(name_param)) = (
            tree.attr(el, MACRO_ID_ATTR),
            find_param(tree, el, DIAGRAM_NAME_PARAM),
        ) else {
            warn!(
                "Malformed inclusion macro left untouched, page: \"{}\"",
                page.source_title
            );
            return;
        };

        let reference = DelayedDiagramRef {
            macro_id,
            ref_page_id: tree.text(page_id_param),
            diagram_name: tree.text(name_param),
        };
        self.delayed
            .lock()
            .entry(page.source_id.clone())
            .or_default()
            .push(reference);
    }

    /// Number of pages with at least one delayed reference.
    pub fn delayed_page_count(&self) -> usize {
        self.delayed.lock().len()
    }

    /// Take all delayed references, grouped by owning page and sorted by
    /// owning page id for a reproducible drain order.
    pub fn take_delayed(&self) -> Vec<(String, Vec<DelayedDiagramRef>)> {
        let mut drained: Vec<_> = self.delayed.lock().drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    /// Second-pass resolution for one owning page: re-fetch its destination
    /// copy (it may already carry edits from the main pass), retry the
    /// substitution per reference and fall back to copying the external
    /// diagram in. The fallback is exhaustive; failure past it is a bug.
    pub async fn resolve_page<S: ContentStore>(
        &self,
        source: &S,
        dest: &S,
        owner: &PageRecord,
        refs: &[DelayedDiagramRef],
    ) -> Result<PageFix> {
        let owner_dest_id = owner.destination_id().ok_or_else(|| {
            SyncError::invariant(format!(
                "page {} has delayed references but no destination id",
                owner.source_id
            ))
        })?;

        let dest_page = dest.get_page_by_id(owner_dest_id, PageExpand::body()).await?;
        let body = dest_page
            .body
            .ok_or_else(|| SyncError::storage("destination page fetched without body"))?;
        let mut tree = Tree::parse(&body)?;

        let mut attachments: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for reference in refs {
            let el = tree
                .find_by_attr(MACRO_TAG, MACRO_ID_ATTR, &reference.macro_id)
                .ok_or_else(|| {
                    SyncError::invariant(format!(
                        "inclusion macro {} missing from destination copy of page {}",
                        reference.macro_id, owner.source_id
                    ))
                })?;
            let page_id_param = find_param(&tree, el, PAGE_ID_PARAM).ok_or_else(|| {
                SyncError::invariant(format!(
                    "inclusion macro {} lost its pageId parameter",
                    reference.macro_id
                ))
            })?;

            if self.try_substitute(&mut tree, page_id_param) {
                continue;
            }

            // Genuinely outside the hierarchy: copy the diagram in and make
            // this page the source for every later reference to it.
            let ref_root = self.ref_page_root(source, &reference.ref_page_id).await?;
            copy_diagram(&mut tree, el, &ref_root, &reference.diagram_name)?;

            self.replacements
                .lock()
                .insert(reference.ref_page_id.clone(), owner_dest_id.to_string());
            attachments
                .entry(reference.ref_page_id.clone())
                .or_default()
                .push(reference.diagram_name.clone());
        }

        Ok(PageFix {
            body: tree.to_storage(),
            attachments: attachments.into_iter().collect(),
        })
    }

    /// Rewrite the pageId parameter in place if a replacement is known:
    /// first the out-of-hierarchy replacement map, then the index (which
    /// only answers once the page has a destination id).
    fn try_substitute(&self, tree: &mut Tree, page_id_param: NodeId) -> bool {
        let ref_page_id = tree.text(page_id_param);

        let replacement = self
            .replacements
            .lock()
            .get(&ref_page_id)
            .cloned()
            .or_else(|| {
                self.index
                    .search_by_id(&ref_page_id)
                    .and_then(|r| r.destination_id().map(str::to_string))
            });

        match replacement {
            Some(new_id) => {
                tree.set_text(page_id_param, &new_id);
                true
            }
            None => false,
        }
    }

    async fn ref_page_root<S: ContentStore>(&self, source: &S, page_id: &str) -> Result<Arc<Tree>> {
        if let Some(cached) = self.root_cache.lock().get(page_id).cloned() {
            return Ok(cached);
        }

        let page = source.get_page_by_id(page_id, PageExpand::body()).await?;
        let body = page
            .body
            .ok_or_else(|| SyncError::storage("referenced page fetched without body"))?;
        let tree = Arc::new(Tree::parse(&body)?);
        self.root_cache
            .lock()
            .insert(page_id.to_string(), tree.clone());
        Ok(tree)
    }
}

/// Child `ac:parameter` element with the given `ac:name`.
pub fn find_param(tree: &Tree, el: NodeId, name: &str) -> Option<NodeId> {
    tree.children_named(el, PARAMETER_TAG)
        .into_iter()
        .find(|&p| tree.attr(p, NAME_ATTR).as_deref() == Some(name))
}

/// Turn an inclusion element into a plain embedded diagram carrying the
/// source diagram's parameters, minus its revision.
fn copy_diagram(
    tree: &mut Tree,
    el: NodeId,
    ref_root: &Tree,
    diagram_name: &str,
) -> Result<()> {
    let source_macro = ref_root
        .find_all(MACRO_TAG)
        .into_iter()
        .find(|&m| {
            ref_root.attr(m, NAME_ATTR).as_deref() == Some(DIAGRAM_MACRO)
                && find_param(ref_root, m, DIAGRAM_NAME_PARAM)
                    .map(|p| ref_root.text(p) == diagram_name)
                    .unwrap_or(false)
        })
        .ok_or_else(|| {
            SyncError::invariant(format!(
                "diagram \"{diagram_name}\" not found on its referenced page"
            ))
        })?;

    tree.set_attr(el, NAME_ATTR, DIAGRAM_MACRO);
    tree.clear_children(el);

    for &child in ref_root.children(source_macro) {
        let is_revision = ref_root.name(child) == Some(PARAMETER_TAG)
            && ref_root.attr(child, NAME_ATTR).as_deref() == Some(REVISION_PARAM);
        if !is_revision {
            tree.copy_subtree_from(ref_root, child, el);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inclusion_body(macro_id: &str, page_id: &str, name: &str) -> String {
        format!(
            concat!(
                r#"<ac:structured-macro ac:name="inc-drawio" ac:macro-id="{mid}">"#,
                r#"<ac:parameter ac:name="pageId">{pid}</ac:parameter>"#,
                r#"<ac:parameter ac:name="diagramName">{name}</ac:parameter>"#,
                r#"<ac:parameter ac:name="includedDiagram">1</ac:parameter>"#,
                r#"</ac:structured-macro>"#,
            ),
            mid = macro_id,
            pid = page_id,
            name = name,
        )
    }

    fn ctx() -> PageCtx {
        PageCtx {
            source_id: "owner".into(),
            source_space: "S".into(),
            source_title: "Owner".into(),
        }
    }

    #[test]
    fn test_inline_substitution_when_destination_known() {
        let index = Arc::new(PageIndex::new());
        let target = index.add_page(PageRecord::new("100", "S", "Target")).unwrap();
        target.set_destination_id("d100").unwrap();

        let resolver = DeferredResolver::new(index);
        let mut tree = Tree::parse(&inclusion_body("m-1", "100", "D")).unwrap();
        let el = tree.find_all(MACRO_TAG)[0];
        resolver.format_inclusion(&ctx(), &mut tree, el);

        assert!(tree.to_storage().contains(">d100<"));
        assert_eq!(resolver.delayed_page_count(), 0);
    }

    #[test]
    fn test_forward_reference_is_deferred() {
        let index = Arc::new(PageIndex::new());
        // Target known but not yet copied
        index.add_page(PageRecord::new("100", "S", "Target")).unwrap();

        let resolver = DeferredResolver::new(index);
        let mut tree = Tree::parse(&inclusion_body("m-1", "100", "D")).unwrap();
        let el = tree.find_all(MACRO_TAG)[0];
        resolver.format_inclusion(&ctx(), &mut tree, el);

        // Body untouched, reference queued under the owning page
        assert!(tree.to_storage().contains(">100<"));
        let delayed = resolver.take_delayed();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].0, "owner");
        assert_eq!(delayed[0].1[0].macro_id, "m-1");
        assert_eq!(delayed[0].1[0].ref_page_id, "100");
    }

    #[test]
    fn test_non_inclusion_macros_ignored() {
        let resolver = DeferredResolver::new(Arc::new(PageIndex::new()));
        let body = concat!(
            r#"<ac:structured-macro ac:name="drawio" ac:macro-id="m-2">"#,
            r#"<ac:parameter ac:name="diagramName">D</ac:parameter>"#,
            r#"</ac:structured-macro>"#,
        );
        let mut tree = Tree::parse(body).unwrap();
        let el = tree.find_all(MACRO_TAG)[0];
        resolver.format_inclusion(&ctx(), &mut tree, el);

        assert_eq!(resolver.delayed_page_count(), 0);
        assert_eq!(tree.to_storage(), body);
    }

    #[test]
    fn test_copy_diagram_strips_revision() {
        let ref_body = concat!(
            r#"<ac:structured-macro ac:name="drawio" ac:macro-id="m-src">"#,
            r#"<ac:parameter ac:name="diagramName">D</ac:parameter>"#,
            r#"<ac:parameter ac:name="revision">7</ac:parameter>"#,
            r#"<ac:parameter ac:name="baseUrl">https://wiki</ac:parameter>"#,
            r#"</ac:structured-macro>"#,
        );
        let ref_root = Tree::parse(ref_body).unwrap();

        let mut tree = Tree::parse(&inclusion_body("m-1", "100", "D")).unwrap();
        let el = tree.find_all(MACRO_TAG)[0];
        copy_diagram(&mut tree, el, &ref_root, "D").unwrap();

        let out = tree.to_storage();
        assert!(out.contains(r#"ac:name="drawio""#));
        assert!(out.contains("baseUrl"));
        assert!(!out.contains("revision"));
        assert!(!out.contains("includedDiagram"));
    }
}

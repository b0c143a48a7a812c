//! Content formatter pipeline: tag formatters applied to a page's body tree.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::deferred::DeferredResolver;
use crate::error::Result;
use crate::index::PageIndex;
use crate::storage::{NodeId, Tree};

/// Page-reference element and its attributes.
pub const PAGE_REF_TAG: &str = "ri:page";
pub const SPACE_KEY_ATTR: &str = "ri:space-key";
pub const CONTENT_TITLE_ATTR: &str = "ri:content-title";

/// Structured-macro element, matched by the diagram fixer.
pub const MACRO_TAG: &str = "ac:structured-macro";

/// Identity of the page currently being formatted.
///
/// An unqualified page reference (no explicit space key) refers to a page in
/// this page's own space.
#[derive(Debug, Clone)]
pub struct PageCtx {
    pub source_id: String,
    pub source_space: String,
    pub source_title: String,
}

/// Composed title rewrite, applied in a fixed order: qualify with the
/// originating space (out-of-hierarchy titles only), then the substring
/// replacement, then the literal prefix.
#[derive(Debug, Clone, Default)]
pub struct TitleTransform {
    /// Sync-root space; titles from any other space get a `"{space}: "`
    /// qualifier. Only set when out-of-hierarchy sync is enabled.
    qualify_outside_of: Option<String>,
    replace: Option<(String, String)>,
    prefix: Option<String>,
}

impl TitleTransform {
    pub fn new(
        replace: Option<(String, String)>,
        prefix: Option<String>,
        qualify_outside_of: Option<String>,
    ) -> Self {
        Self {
            qualify_outside_of,
            replace,
            prefix,
        }
    }

    pub fn apply(&self, space: &str, title: &str) -> String {
        let mut out = title.to_string();
        if let Some(root_space) = &self.qualify_outside_of {
            if root_space != space {
                out = format!("{space}: {out}");
            }
        }
        if let Some((old, new)) = &self.replace {
            out = out.replace(old, new);
        }
        if let Some(prefix) = &self.prefix {
            out = format!("{prefix}{out}");
        }
        out
    }
}

/// Rewrites every page-reference title and re-points explicit space keys at
/// the destination space.
#[derive(Debug, Clone)]
pub struct PageRefRewrite {
    pub transform: TitleTransform,
    pub dest_space: String,
}

/// Same rewrite as [`PageRefRewrite`], but only for references whose target
/// is in the hierarchy index; everything else is left untouched.
#[derive(Clone)]
pub struct HierarchyRefRewrite {
    pub transform: TitleTransform,
    pub index: Arc<PageIndex>,
    pub dest_space: String,
}

/// Read-only: warns about references that point outside the hierarchy when
/// out-of-hierarchy sync is disabled.
#[derive(Clone)]
pub struct OutHierarchyCheck {
    pub index: Arc<PageIndex>,
}

/// Accumulates `(space, title)` pairs of references pointing outside the
/// hierarchy, for later discovery by the dependency-forest builder. Pages
/// are formatted concurrently, so the set is lock-guarded.
pub struct OutHierarchyCollector {
    index: Arc<PageIndex>,
    pages: Mutex<HashSet<(String, String)>>,
}

impl OutHierarchyCollector {
    pub fn new(index: Arc<PageIndex>) -> Self {
        Self {
            index,
            pages: Mutex::new(HashSet::new()),
        }
    }

    fn collect(&self, page: &PageCtx, tree: &Tree, el: NodeId) {
        let Some((space, title)) = reference_target(page, tree, el) else {
            return;
        };
        if self.index.search_by_title(&space, &title).is_none() {
            self.pages.lock().insert((space, title));
        }
    }

    /// Take the collected references, leaving the set empty.
    pub fn drain(&self) -> Vec<(String, String)> {
        let mut set = self.pages.lock();
        let mut pages: Vec<_> = set.drain().collect();
        // Deterministic discovery order
        pages.sort();
        pages
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }
}

/// A content formatter; a closed set of variants sharing one dispatch point.
#[derive(Clone)]
pub enum TagFormatter {
    PageRefRewrite(PageRefRewrite),
    HierarchyRefRewrite(HierarchyRefRewrite),
    OutHierarchyCheck(OutHierarchyCheck),
    OutHierarchyCollect(Arc<OutHierarchyCollector>),
    DiagramFix(Arc<DeferredResolver>),
}

impl TagFormatter {
    /// Tag name this formatter is registered for.
    pub fn pattern(&self) -> &'static str {
        match self {
            TagFormatter::PageRefRewrite(_)
            | TagFormatter::HierarchyRefRewrite(_)
            | TagFormatter::OutHierarchyCheck(_)
            | TagFormatter::OutHierarchyCollect(_) => PAGE_REF_TAG,
            TagFormatter::DiagramFix(_) => MACRO_TAG,
        }
    }

    pub fn format(&self, page: &PageCtx, tree: &mut Tree, el: NodeId) {
        match self {
            TagFormatter::PageRefRewrite(f) => {
                rewrite_reference(&f.transform, &f.dest_space, page, tree, el)
            }
            TagFormatter::HierarchyRefRewrite(f) => {
                let Some((space, title)) = reference_target(page, tree, el) else {
                    return;
                };
                if f.index.search_by_title(&space, &title).is_some() {
                    rewrite_reference(&f.transform, &f.dest_space, page, tree, el);
                }
            }
            TagFormatter::OutHierarchyCheck(f) => {
                let Some((space, title)) = reference_target(page, tree, el) else {
                    return;
                };
                if f.index.search_by_title(&space, &title).is_none() {
                    warn!(
                        "Out of hierarchy page link \"{}\", page: \"{}\"",
                        title, page.source_title
                    );
                }
            }
            TagFormatter::OutHierarchyCollect(f) => f.collect(page, tree, el),
            TagFormatter::DiagramFix(resolver) => resolver.format_inclusion(page, tree, el),
        }
    }
}

/// Referenced `(space, title)` of a page-reference element; the space
/// defaults to the formatted page's own space.
fn reference_target(page: &PageCtx, tree: &Tree, el: NodeId) -> Option<(String, String)> {
    let title = tree.attr(el, CONTENT_TITLE_ATTR)?;
    let space = tree
        .attr(el, SPACE_KEY_ATTR)
        .unwrap_or_else(|| page.source_space.clone());
    Some((space, title))
}

fn rewrite_reference(
    transform: &TitleTransform,
    dest_space: &str,
    page: &PageCtx,
    tree: &mut Tree,
    el: NodeId,
) {
    let Some(title) = tree.attr(el, CONTENT_TITLE_ATTR) else {
        return;
    };

    // An explicit space key is re-pointed at the destination space; an
    // absent one keeps meaning "same space as the surrounding page".
    let space = match tree.attr(el, SPACE_KEY_ATTR) {
        Some(space) => {
            tree.set_attr(el, SPACE_KEY_ATTR, dest_space);
            space
        }
        None => page.source_space.clone(),
    };

    tree.set_attr(el, CONTENT_TITLE_ATTR, &transform.apply(&space, &title));
}

/// Apply formatters to a page body: parse, group the formatters by match
/// pattern, run every formatter of a pattern over every matched element in
/// registration order, and re-serialize. With no formatters registered the
/// body is returned unchanged without a parse round-trip.
pub fn format_page(page: &PageCtx, body: &str, formatters: &[TagFormatter]) -> Result<String> {
    if formatters.is_empty() {
        return Ok(body.to_string());
    }

    let mut tree = Tree::parse(body)?;

    let mut groups: Vec<(&'static str, Vec<&TagFormatter>)> = Vec::new();
    for formatter in formatters {
        let pattern = formatter.pattern();
        match groups.iter_mut().find(|(p, _)| *p == pattern) {
            Some((_, group)) => group.push(formatter),
            None => groups.push((pattern, vec![formatter])),
        }
    }

    for (pattern, group) in groups {
        for el in tree.find_all(pattern) {
            for formatter in &group {
                formatter.format(page, &mut tree, el);
            }
        }
    }

    Ok(tree.to_storage())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::PageRecord;

    fn ctx() -> PageCtx {
        PageCtx {
            source_id: "1".into(),
            source_space: "S".into(),
            source_title: "Owner".into(),
        }
    }

    #[test]
    fn test_transform_composition_out_of_hierarchy() {
        let transform = TitleTransform::new(
            Some(("a".into(), "b".into())),
            Some("P".into()),
            Some("ROOT".into()),
        );
        // Qualifier applies: the title's space differs from the root space
        assert_eq!(transform.apply("S", "Tap"), "PS: Tbp");
    }

    #[test]
    fn test_transform_composition_in_hierarchy() {
        let transform = TitleTransform::new(
            Some(("a".into(), "b".into())),
            Some("P".into()),
            Some("S".into()),
        );
        // Same space as the root: no qualifier
        assert_eq!(transform.apply("S", "Tap"), "PTbp");
    }

    #[test]
    fn test_empty_pipeline_skips_roundtrip() {
        // Not even parseable; must come back untouched
        let body = "<p><broken";
        assert_eq!(format_page(&ctx(), body, &[]).unwrap(), body);
    }

    #[test]
    fn test_page_ref_rewrite_sets_space_and_title() {
        let formatter = TagFormatter::PageRefRewrite(PageRefRewrite {
            transform: TitleTransform::new(None, Some("P ".into()), None),
            dest_space: "DST".into(),
        });

        let body = r#"<ri:page ri:space-key="EXT" ri:content-title="X"/>"#;
        let out = format_page(&ctx(), body, &[formatter.clone()]).unwrap();
        assert!(out.contains(r#"ri:space-key="DST""#));
        assert!(out.contains(r#"ri:content-title="P X""#));

        // No explicit space key: stays unqualified, title still rewritten
        let body = r#"<ri:page ri:content-title="X"/>"#;
        let out = format_page(&ctx(), body, &[formatter]).unwrap();
        assert!(!out.contains("ri:space-key"));
        assert!(out.contains(r#"ri:content-title="P X""#));
    }

    #[test]
    fn test_hierarchy_gated_rewrite_leaves_foreign_refs() {
        let index = Arc::new(PageIndex::new());
        index.add_page(PageRecord::new("2", "S", "Known")).unwrap();

        let formatter = TagFormatter::HierarchyRefRewrite(HierarchyRefRewrite {
            transform: TitleTransform::new(None, Some("P ".into()), None),
            index,
            dest_space: "DST".into(),
        });

        let body = concat!(
            r#"<ri:page ri:content-title="Known"/>"#,
            r#"<ri:page ri:space-key="EXT" ri:content-title="Foreign"/>"#,
        );
        let out = format_page(&ctx(), body, &[formatter]).unwrap();
        assert!(out.contains(r#"ri:content-title="P Known""#));
        // The out-of-hierarchy reference is untouched
        assert!(out.contains(r#"<ri:page ri:space-key="EXT" ri:content-title="Foreign"/>"#));
    }

    #[test]
    fn test_collector_dedups_and_scopes_to_page_space() {
        let index = Arc::new(PageIndex::new());
        index.add_page(PageRecord::new("2", "S", "Known")).unwrap();
        let collector = Arc::new(OutHierarchyCollector::new(index));

        let body = concat!(
            r#"<ri:page ri:content-title="Known"/>"#,
            r#"<ri:page ri:content-title="Local"/>"#,
            r#"<ri:page ri:space-key="EXT" ri:content-title="X"/>"#,
            r#"<ri:page ri:space-key="EXT" ri:content-title="X"/>"#,
        );
        format_page(
            &ctx(),
            body,
            &[TagFormatter::OutHierarchyCollect(collector.clone())],
        )
        .unwrap();

        let collected = collector.drain();
        assert_eq!(
            collected,
            vec![
                ("EXT".to_string(), "X".to_string()),
                ("S".to_string(), "Local".to_string()),
            ]
        );
        assert!(collector.is_empty());
    }
}

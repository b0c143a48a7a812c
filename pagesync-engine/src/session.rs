//! Hierarchy synchronization session.
//!
//! A session copies one page hierarchy between two stores: level by level
//! down the tree, every page of a level in its own task. A level is always
//! drained completely before the first failure is propagated, and no level
//! is started after a failure, so the destination never holds a child
//! whose parent was not written.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::info;

use pagesync_store::{ContentStore, Page, PageExpand, UpdatePage};

use crate::attachments::AttachmentSync;
use crate::config::SyncParams;
use crate::deferred::{DeferredResolver, FIX_COMMENT};
use crate::deps::{build_forest, DependencyForest, ForestNodeId};
use crate::error::{Result, SyncError};
use crate::fmt::{
    format_page, HierarchyRefRewrite, OutHierarchyCheck, OutHierarchyCollector, PageCtx,
    PageRefRewrite, TagFormatter, TitleTransform,
};
use crate::index::{PageIndex, PageRecord};
use crate::progress::SyncReporter;

/// Body of a page created only to preserve the hierarchy of copied
/// external pages.
pub const PLACEHOLDER_BODY: &str =
    "Empty page that preserves the hierarchy of copied external pages";

/// Outcome counters of one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncReport {
    /// Pages written or confirmed up to date, placeholders included.
    pub pages_synced: usize,
    /// Placeholder pages among them.
    pub nominal_pages: usize,
    /// Pages whose diagram inclusions needed the deferred fix pass.
    pub diagrams_fixed: usize,
}

/// Page synchronizer over a pair of content stores.
pub struct Synchronizer<S> {
    source: Arc<S>,
    dest: Arc<S>,
}

impl<S: ContentStore + 'static> Synchronizer<S> {
    pub fn new(source: Arc<S>, dest: Arc<S>) -> Self {
        Self { source, dest }
    }

    /// Copy the hierarchy rooted at `params.source_title` into the
    /// destination space. Progress events go to `reporter` when given.
    pub async fn sync_page_hierarchy(
        &self,
        params: SyncParams,
        reporter: Option<SyncReporter>,
    ) -> Result<SyncReport> {
        let session =
            Session::open(self.source.clone(), self.dest.clone(), params, reporter).await?;
        session.run().await
    }
}

#[derive(Default)]
struct Stats {
    pages_synced: AtomicUsize,
    nominal_pages: AtomicUsize,
    diagrams_fixed: AtomicUsize,
}

/// One unit of replication work; a level is a batch of these.
enum WorkItem {
    Hierarchy {
        page: Page,
        dest_parent_id: String,
    },
    Forest {
        forest: Arc<DependencyForest>,
        space: String,
        node: ForestNodeId,
        dest_parent_id: String,
    },
}

struct Session<S> {
    source: Arc<S>,
    dest: Arc<S>,
    params: SyncParams,
    index: Arc<PageIndex>,
    transform: TitleTransform,
    resolver: Arc<DeferredResolver>,
    collector: Option<Arc<OutHierarchyCollector>>,
    hierarchy_formatters: Vec<TagFormatter>,
    forest_formatters: Vec<TagFormatter>,
    attachments: AttachmentSync,
    reporter: Option<SyncReporter>,
    semaphore: Arc<Semaphore>,
    stats: Stats,
    source_root: Page,
    dest_root_id: String,
}

impl<S: ContentStore + 'static> Session<S> {
    async fn open(
        source: Arc<S>,
        dest: Arc<S>,
        params: SyncParams,
        reporter: Option<SyncReporter>,
    ) -> Result<Arc<Self>> {
        let source_root = source
            .get_page_by_title(&params.source_space, &params.source_title, PageExpand::full())
            .await?
            .ok_or_else(|| {
                SyncError::page_not_found(&params.source_space, &params.source_title)
            })?;

        let dest_root_id = match &params.dest_title {
            Some(title) => dest
                .get_page_by_title(&params.dest_space, title, PageExpand::none())
                .await?
                .ok_or_else(|| SyncError::page_not_found(&params.dest_space, title))?
                .id,
            None => dest.get_space_homepage(&params.dest_space).await?.id,
        };

        let index = Arc::new(PageIndex::new());
        index.add_page(PageRecord::new(
            &source_root.id,
            &params.source_space,
            &source_root.title,
        ))?;
        let descendants = source
            .list_descendant_pages(&params.source_space, &source_root.id)
            .await?;
        for page in descendants {
            index.add_page(PageRecord::new(&page.id, &params.source_space, &page.title))?;
        }

        let transform = TitleTransform::new(
            params.replace_title_substr.clone(),
            params.start_title_with.clone(),
            params
                .sync_out_hierarchy
                .then(|| params.source_space.clone()),
        );

        let resolver = Arc::new(DeferredResolver::new(index.clone()));
        let diagram_fix = TagFormatter::DiagramFix(resolver.clone());

        let full_rewrite = TagFormatter::PageRefRewrite(PageRefRewrite {
            transform: transform.clone(),
            dest_space: params.dest_space.clone(),
        });

        let (collector, hierarchy_formatters) = if params.sync_out_hierarchy {
            let collector = Arc::new(OutHierarchyCollector::new(index.clone()));
            let formatters = vec![
                TagFormatter::OutHierarchyCollect(collector.clone()),
                full_rewrite.clone(),
                diagram_fix.clone(),
            ];
            (Some(collector), formatters)
        } else {
            let formatters = vec![
                TagFormatter::OutHierarchyCheck(OutHierarchyCheck {
                    index: index.clone(),
                }),
                TagFormatter::HierarchyRefRewrite(HierarchyRefRewrite {
                    transform: transform.clone(),
                    index: index.clone(),
                    dest_space: params.dest_space.clone(),
                }),
                diagram_fix.clone(),
            ];
            (None, formatters)
        };

        let forest_formatters = vec![full_rewrite, diagram_fix];

        let attachments = AttachmentSync::new(params.max_concurrency);
        let semaphore = Arc::new(Semaphore::new(params.max_concurrency.max(1)));

        Ok(Arc::new(Self {
            source,
            dest,
            params,
            index,
            transform,
            resolver,
            collector,
            hierarchy_formatters,
            forest_formatters,
            attachments,
            reporter,
            semaphore,
            stats: Stats::default(),
            source_root,
            dest_root_id,
        }))
    }

    async fn run(self: Arc<Self>) -> Result<SyncReport> {
        self.add_total(self.index.count());

        let root = WorkItem::Hierarchy {
            page: self.source_root.clone(),
            dest_parent_id: self.dest_root_id.clone(),
        };
        self.drive(vec![root]).await?;

        if self.params.sync_out_hierarchy {
            self.sync_out_hierarchy_pages().await?;
        }

        self.fix_included_diagrams().await?;

        Ok(SyncReport {
            pages_synced: self.stats.pages_synced.load(Ordering::Relaxed),
            nominal_pages: self.stats.nominal_pages.load(Ordering::Relaxed),
            diagrams_fixed: self.stats.diagrams_fixed.load(Ordering::Relaxed),
        })
    }

    /// Process levels until exhaustion. Every task of a level runs to
    /// completion before errors are inspected, so a failure never leaves
    /// sibling tasks dangling; the next level is not started after one.
    async fn drive(self: &Arc<Self>, mut level: Vec<WorkItem>) -> Result<()> {
        while !level.is_empty() {
            let mut handles = Vec::with_capacity(level.len());
            for item in level.drain(..) {
                let session = self.clone();
                let semaphore = self.semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| SyncError::Task(e.to_string()))?;
                    session.process(item).await
                }));
            }

            let mut next = Vec::new();
            let mut first_error = None;
            for joined in join_all(handles).await {
                match joined {
                    Ok(Ok(children)) => next.extend(children),
                    Ok(Err(err)) => first_error = first_error.or(Some(err)),
                    Err(err) => {
                        first_error = first_error.or(Some(SyncError::Task(err.to_string())))
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }

            level = next;
        }
        Ok(())
    }

    async fn process(self: &Arc<Self>, item: WorkItem) -> Result<Vec<WorkItem>> {
        match item {
            WorkItem::Hierarchy {
                page,
                dest_parent_id,
            } => {
                let record = self.index.search_by_id(&page.id).ok_or_else(|| {
                    SyncError::invariant(format!("page {} missing from the index", page.id))
                })?;

                let dest_id = self
                    .sync_page(&record, &self.hierarchy_formatters, &page, &dest_parent_id, false)
                    .await?;

                let children = self
                    .source
                    .get_child_pages(&page.id, PageExpand::body())
                    .await?;
                Ok(children
                    .into_iter()
                    .map(|child| WorkItem::Hierarchy {
                        page: child,
                        dest_parent_id: dest_id.clone(),
                    })
                    .collect())
            }
            WorkItem::Forest {
                forest,
                space,
                node,
                dest_parent_id,
            } => {
                let title = &forest.node(&space, node).title;
                let nominal = forest.node(&space, node).placeholder;

                let page = self
                    .source
                    .get_page_by_title(&space, title, PageExpand::body())
                    .await?
                    .ok_or_else(|| SyncError::page_not_found(&space, title))?;

                // Placeholder pages are deliberately absent from the index,
                // so diagram inclusions never resolve against them.
                let record = match self.index.search_by_title(&space, &page.title) {
                    Some(record) => record,
                    None => Arc::new(PageRecord::new(&page.id, &space, &page.title)),
                };

                let dest_id = self
                    .sync_page(&record, &self.forest_formatters, &page, &dest_parent_id, nominal)
                    .await?;

                Ok(forest
                    .children(&space, node)
                    .iter()
                    .map(|&child| WorkItem::Forest {
                        forest: forest.clone(),
                        space: space.clone(),
                        node: child,
                        dest_parent_id: dest_id.clone(),
                    })
                    .collect())
            }
        }
    }

    async fn sync_page(
        &self,
        record: &PageRecord,
        formatters: &[TagFormatter],
        page: &Page,
        dest_parent_id: &str,
        nominal: bool,
    ) -> Result<String> {
        let dest_id = self
            .sync_body(record, formatters, page, dest_parent_id, nominal)
            .await?;

        if !nominal {
            self.attachments
                .sync_page(&*self.source, &*self.dest, &record.source_id, &dest_id)
                .await?;
        } else {
            self.stats.nominal_pages.fetch_add(1, Ordering::Relaxed);
        }

        info!("Page synced, \"{}\"", page.title);
        self.stats.pages_synced.fetch_add(1, Ordering::Relaxed);
        self.add_synced(1);

        Ok(dest_id)
    }

    async fn sync_body(
        &self,
        record: &PageRecord,
        formatters: &[TagFormatter],
        page: &Page,
        dest_parent_id: &str,
        nominal: bool,
    ) -> Result<String> {
        let dest_space = &self.params.dest_space;
        let new_title = self.transform.apply(&record.source_space, &record.source_title);

        let dest_page = if nominal {
            // An existing page with this title already preserves the
            // hierarchy; nothing to write.
            match self
                .dest
                .get_page_by_title(dest_space, &new_title, PageExpand::none())
                .await?
            {
                Some(existing) => existing,
                None => {
                    self.dest
                        .create_page(dest_space, &new_title, PLACEHOLDER_BODY, dest_parent_id)
                        .await?
                }
            }
        } else {
            let old_body = page
                .body
                .as_deref()
                .ok_or_else(|| SyncError::storage("source page fetched without body"))?;
            let ctx = PageCtx {
                source_id: record.source_id.clone(),
                source_space: record.source_space.clone(),
                source_title: record.source_title.clone(),
            };
            let new_body = format_page(&ctx, old_body, formatters)?;

            match self
                .dest
                .get_page_by_title(dest_space, &new_title, PageExpand::ancestors())
                .await?
            {
                Some(existing) => {
                    if self
                        .dest
                        .is_content_already_updated(&existing.id, &new_body, &new_title)
                        .await?
                    {
                        // Content unchanged; at most the page moved.
                        if let Some(current_parent) = existing.parent_id() {
                            if current_parent != dest_parent_id {
                                self.dest
                                    .move_page(dest_space, &existing.id, dest_parent_id)
                                    .await?;
                            }
                        }
                        existing
                    } else {
                        self.dest
                            .update_page(
                                UpdatePage::new(&existing.id, &new_title, &new_body)
                                    .parent_id(dest_parent_id),
                            )
                            .await?
                    }
                }
                None => {
                    self.dest
                        .create_page(dest_space, &new_title, &new_body, dest_parent_id)
                        .await?
                }
            }
        };

        record.set_destination_id(&dest_page.id)?;
        info!("Page body synced, \"{}\"", record.source_title);

        Ok(dest_page.id)
    }

    /// Replicate referenced pages outside the copied hierarchy: build the
    /// dependency forest from the collected references, then copy it level
    /// by level under the destination root.
    async fn sync_out_hierarchy_pages(self: &Arc<Self>) -> Result<()> {
        let Some(collector) = &self.collector else {
            return Ok(());
        };

        let forest = Arc::new(build_forest(&*self.source, &self.index, collector).await?);
        if forest.is_empty() {
            return Ok(());
        }

        self.add_total(forest.page_count());
        info!(
            "Syncing out hierarchy pages, page count: {}",
            forest.page_count()
        );

        let mut roots = Vec::new();
        for space in forest.spaces() {
            for &node in forest.roots(space) {
                roots.push(WorkItem::Forest {
                    forest: forest.clone(),
                    space: space.to_string(),
                    node,
                    dest_parent_id: self.dest_root_id.clone(),
                });
            }
        }
        self.drive(roots).await
    }

    /// Second pass over pages whose diagram inclusions could not be
    /// resolved inline. Each fixed page is re-counted once its references
    /// are final.
    async fn fix_included_diagrams(&self) -> Result<()> {
        let delayed = self.resolver.delayed_page_count();
        info!(
            "Fixing pages with included drawio diagrams, page count: {delayed}"
        );
        if delayed == 0 {
            return Ok(());
        }
        self.add_synced(-(delayed as i64));

        for (owner_id, refs) in self.resolver.take_delayed() {
            let owner = self.index.search_by_id(&owner_id).ok_or_else(|| {
                SyncError::invariant(format!(
                    "page {owner_id} has delayed references but is not indexed"
                ))
            })?;

            let fix = self
                .resolver
                .resolve_page(&*self.source, &*self.dest, &owner, &refs)
                .await?;

            let new_title = self.transform.apply(&owner.source_space, &owner.source_title);
            let dest_id = owner.destination_id().ok_or_else(|| {
                SyncError::invariant(format!("page {owner_id} was never written"))
            })?;

            self.dest
                .update_page(
                    UpdatePage::new(dest_id, &new_title, &fix.body)
                        .version_comment(FIX_COMMENT),
                )
                .await?;

            for (ref_page_id, names) in &fix.attachments {
                self.attachments
                    .copy_named(&*self.source, &*self.dest, ref_page_id, dest_id, names)
                    .await?;
            }

            info!("Included drawio diagram fixed, page: \"{new_title}\"");
            self.stats.diagrams_fixed.fetch_add(1, Ordering::Relaxed);
            self.add_synced(1);
        }

        Ok(())
    }

    fn add_total(&self, n: usize) {
        if let Some(reporter) = &self.reporter {
            reporter.add_total(n);
        }
    }

    fn add_synced(&self, delta: i64) {
        if let Some(reporter) = &self.reporter {
            reporter.add_synced(delta);
        }
    }
}

//! End-to-end engine tests over in-memory store pairs.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use pagesync_store::{Bytes, MemoryStore};

use crate::config::SyncParams;
use crate::progress::{EventChannel, SyncEvent};
use crate::session::{SyncReport, Synchronizer, PLACEHOLDER_BODY};

fn stores() -> (Arc<MemoryStore>, Arc<MemoryStore>) {
    let dest = MemoryStore::new();
    dest.add_space("DST", "Home");
    (Arc::new(MemoryStore::new()), Arc::new(dest))
}

async fn run(
    source: &Arc<MemoryStore>,
    dest: &Arc<MemoryStore>,
    params: SyncParams,
) -> crate::error::Result<SyncReport> {
    Synchronizer::new(source.clone(), dest.clone())
        .sync_page_hierarchy(params, None)
        .await
}

fn inclusion(macro_id: &str, page_id: &str, name: &str) -> String {
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

fn diagram(name: &str) -> String {
    format!(
        concat!(
            r#"<ac:structured-macro ac:name="drawio" ac:macro-id="src-macro">"#,
            r#"<ac:parameter ac:name="diagramName">{name}</ac:parameter>"#,
            r#"<ac:parameter ac:name="revision">3</ac:parameter>"#,
            r#"</ac:structured-macro>"#,
        ),
        name = name,
    )
}

#[tokio::test]
async fn test_hierarchy_replicated_with_rewritten_links() {
    let (source, dest) = stores();
    let home = source.add_space("SRC", "Home");
    let root = source.add_page("SRC", "Root", r#"<p><ri:page ri:content-title="B"/></p>"#, &home);
    source.add_page("SRC", "A", "<p>a</p>", &root);
    let b = source.add_page(
        "SRC",
        "B",
        concat!(
            r#"<ri:page ri:space-key="SRC" ri:content-title="A"/>"#,
            r#"<ri:page ri:space-key="EXT" ri:content-title="Elsewhere"/>"#,
        ),
        &root,
    );
    source.add_page("SRC", "C", "<p>c</p>", &b);

    let params = SyncParams::new("SRC", "Root", "DST").start_title_with("P ");
    let report = run(&source, &dest, params).await.unwrap();

    assert_eq!(report.pages_synced, 4);
    assert_eq!(report.nominal_pages, 0);
    assert_eq!(report.diagrams_fixed, 0);

    // Titles carry the prefix, parentage mirrors the source
    let dst_root = dest.page_by_title("DST", "P Root").unwrap();
    let dst_b = dest.page_by_title("DST", "P B").unwrap();
    let dst_c = dest.page_by_title("DST", "P C").unwrap();
    assert_eq!(dst_b.parent_id(), Some(dst_root.id.as_str()));
    assert_eq!(dst_c.parent_id(), Some(dst_b.id.as_str()));

    // In-hierarchy links rewritten, both unqualified and space-qualified
    let root_body = dest.body_of("DST", "P Root").unwrap();
    assert!(root_body.contains(r#"ri:content-title="P B""#));
    let b_body = dest.body_of("DST", "P B").unwrap();
    assert!(b_body.contains(r#"<ri:page ri:space-key="DST" ri:content-title="P A"/>"#));
    // Reference outside the hierarchy left untouched
    assert!(b_body.contains(r#"<ri:page ri:space-key="EXT" ri:content-title="Elsewhere"/>"#));
}

#[tokio::test]
async fn test_second_run_writes_nothing() {
    let (source, dest) = stores();
    let home = source.add_space("SRC", "Home");
    let root = source.add_page("SRC", "Root", r#"<p><ri:page ri:content-title="A"/></p>"#, &home);
    let a = source.add_page("SRC", "A", "<p>a</p>", &root);
    source.add_attachment(
        &a,
        "chart.png",
        Bytes::from_static(b"png"),
        None,
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    );

    let params = SyncParams::new("SRC", "Root", "DST");
    run(&source, &dest, params.clone()).await.unwrap();

    let pages_after_first = dest.page_count();
    let uploads_after_first = dest.attachment_upload_count();
    assert_eq!(uploads_after_first, 1);

    run(&source, &dest, params).await.unwrap();

    assert_eq!(dest.page_count(), pages_after_first);
    assert_eq!(dest.body_update_count(), 0);
    assert_eq!(dest.attachment_upload_count(), uploads_after_first);
}

#[tokio::test]
async fn test_forward_diagram_reference_fixed_after_replication() {
    let (source, dest) = stores();
    let home = source.add_space("SRC", "Home");
    let root = source.add_page("SRC", "Root", "<p/>", &home);
    // A includes a diagram owned by a page one level deeper, whose copy
    // does not exist yet when A is replicated
    let b = source.add_page("SRC", "B", "<p>b</p>", &root);
    let deep_body = diagram("D");
    let deep = source.add_page("SRC", "Deep", &deep_body, &b);
    source.add_page("SRC", "A", &inclusion("m-fwd", &deep, "D"), &root);

    let report = run(&source, &dest, SyncParams::new("SRC", "Root", "DST"))
        .await
        .unwrap();
    assert_eq!(report.diagrams_fixed, 1);

    let dst_deep = dest.page_by_title("DST", "Deep").unwrap();
    let a_body = dest.body_of("DST", "A").unwrap();
    // The inclusion now points at the copied page, not the source id
    assert!(a_body.contains(&format!(">{}<", dst_deep.id)));
    assert!(!a_body.contains(&format!(">{deep}<")));
    // Still an inclusion; the diagram itself lives on the copied page
    assert!(a_body.contains(r#"ac:name="inc-drawio""#));
}

#[tokio::test]
async fn test_external_diagram_copied_once_and_shared() {
    let (source, dest) = stores();
    let home = source.add_space("SRC", "Home");
    let root = source.add_page("SRC", "Root", "<p/>", &home);

    // Diagram owner outside the hierarchy
    let lib_body = diagram("D");
    let lib = source.add_page("SRC", "Library", &lib_body, &home);
    source.add_attachment(
        &lib,
        "D",
        Bytes::from_static(b"xml"),
        None,
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    );

    source.add_page("SRC", "First", &inclusion("m-1", &lib, "D"), &root);
    source.add_page("SRC", "Second", &inclusion("m-2", &lib, "D"), &root);

    let report = run(&source, &dest, SyncParams::new("SRC", "Root", "DST"))
        .await
        .unwrap();
    assert_eq!(report.diagrams_fixed, 2);

    // "First" has the lower source id, so it receives the diagram
    let first_body = dest.body_of("DST", "First").unwrap();
    assert!(first_body.contains(r#"ac:name="drawio""#));
    assert!(first_body.contains(r#"ac:name="diagramName""#));
    assert!(!first_body.contains("revision"));

    let dst_first = dest.page_by_title("DST", "First").unwrap();
    assert!(dest.attachment_data(&dst_first.id, "D").is_some());

    // "Second" keeps its inclusion but now points at the first copy
    let second_body = dest.body_of("DST", "Second").unwrap();
    assert!(second_body.contains(r#"ac:name="inc-drawio""#));
    assert!(second_body.contains(&format!(">{}<", dst_first.id)));

    let dst_second = dest.page_by_title("DST", "Second").unwrap();
    assert!(dest.attachment_data(&dst_second.id, "D").is_none());
}

#[tokio::test]
async fn test_out_hierarchy_pages_replicated_with_placeholders() {
    let (source, dest) = stores();
    let src_home = source.add_space("SRC", "Home");
    source.add_page(
        "SRC",
        "Root",
        r#"<p><ri:page ri:space-key="EXT" ri:content-title="X"/></p>"#,
        &src_home,
    );

    let ext_home = source.add_space("EXT", "ExtHome");
    let parent = source.add_page("EXT", "Parent", "<p>parent text</p>", &ext_home);
    source.add_page("EXT", "X", "<p>external</p>", &parent);

    let params = SyncParams::new("SRC", "Root", "DST").sync_out_hierarchy(true);
    let report = run(&source, &dest, params).await.unwrap();

    assert_eq!(report.pages_synced, 3);
    assert_eq!(report.nominal_pages, 1);

    // The external page gets a space-qualified title; its ancestor is an
    // empty placeholder preserving the position
    let dst_root = dest.page_by_title("DST", "Root").unwrap();
    let dst_parent = dest.page_by_title("DST", "EXT: Parent").unwrap();
    let dst_x = dest.page_by_title("DST", "EXT: X").unwrap();
    assert_eq!(dest.body_of("DST", "EXT: Parent").unwrap(), PLACEHOLDER_BODY);
    assert_eq!(dest.body_of("DST", "EXT: X").unwrap(), "<p>external</p>");
    assert_eq!(dst_x.parent_id(), Some(dst_parent.id.as_str()));

    // The root's reference is rewritten to the copied title
    let root_body = dest.body_of("DST", "Root").unwrap();
    assert!(root_body.contains(r#"<ri:page ri:space-key="DST" ri:content-title="EXT: X"/>"#));
    assert!(dst_root.parent_id().is_some());
}

#[tokio::test]
async fn test_failure_drains_level_and_stops_descent() {
    let (source, dest) = stores();
    let home = source.add_space("SRC", "Home");
    let root = source.add_page("SRC", "Root", "<p/>", &home);
    let a = source.add_page("SRC", "A", "<p>a</p>", &root);
    source.add_page("SRC", "B", "<p>b</p>", &root);
    source.add_page("SRC", "C", "<p>c</p>", &a);

    dest.fail_writes_for_title("A");

    let err = run(&source, &dest, SyncParams::new("SRC", "Root", "DST"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("injected"));

    // The sibling of the failed page was still written; the failed page's
    // child was never attempted
    assert!(dest.page_by_title("DST", "Root").is_some());
    assert!(dest.page_by_title("DST", "B").is_some());
    assert!(dest.page_by_title("DST", "A").is_none());
    assert!(dest.page_by_title("DST", "C").is_none());
}

#[tokio::test]
async fn test_missing_source_root_is_an_error() {
    let (source, dest) = stores();
    source.add_space("SRC", "Home");

    let err = run(&source, &dest, SyncParams::new("SRC", "Nope", "DST"))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::error::SyncError::PageNotFound { .. }));
}

#[tokio::test]
async fn test_progress_events_track_discovery_and_completion() {
    let (source, dest) = stores();
    let home = source.add_space("SRC", "Home");
    let root = source.add_page("SRC", "Root", "<p/>", &home);
    source.add_page("SRC", "A", "<p>a</p>", &root);

    let (reporter, mut channel) = EventChannel::new();
    Synchronizer::new(source.clone(), dest.clone())
        .sync_page_hierarchy(SyncParams::new("SRC", "Root", "DST"), Some(reporter))
        .await
        .unwrap();

    let mut last_total = 0;
    let mut last_synced = 0;
    while let Some(event) = channel.try_recv() {
        match event {
            SyncEvent::TotalPageCountChanged { total } => last_total = total,
            SyncEvent::SyncedPageCountChanged { count } => last_synced = count,
        }
    }
    assert_eq!(last_total, 2);
    assert_eq!(last_synced, 2);
}

#[tokio::test]
async fn test_title_replacement_applies_to_every_copy() {
    let (source, dest) = stores();
    let home = source.add_space("SRC", "Home");
    let root = source.add_page("SRC", "Team Root", "<p/>", &home);
    source.add_page("SRC", "Team Notes", "<p/>", &root);

    let params = SyncParams::new("SRC", "Team Root", "DST").replace_title_substr("Team", "Org");
    run(&source, &dest, params).await.unwrap();

    assert!(dest.page_by_title("DST", "Org Root").is_some());
    assert!(dest.page_by_title("DST", "Org Notes").is_some());
}

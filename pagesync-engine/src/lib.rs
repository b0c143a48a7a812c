//! Page-hierarchy synchronization engine.
//!
//! Replicates a tree of rich-text wiki pages between two content stores:
//! - Level-synchronous concurrent replication of the hierarchy
//! - Cross-reference rewriting through a formatter pipeline
//! - Optional replication of referenced pages outside the hierarchy,
//!   with placeholder ancestors preserving their position
//! - Two-phase resolution of included diagram references
//! - Attachment replication with last-modified gating
//! - Progress events over an async channel

pub mod attachments;
pub mod config;
pub mod deferred;
pub mod deps;
pub mod error;
pub mod fmt;
pub mod index;
pub mod progress;
pub mod session;
pub mod storage;

// Re-export main types and functions
pub use attachments::AttachmentSync;
pub use config::SyncParams;
pub use deferred::{DeferredResolver, DelayedDiagramRef};
pub use deps::DependencyForest;
pub use error::{Result, SyncError};
pub use fmt::{format_page, PageCtx, TagFormatter, TitleTransform};
pub use index::{PageIndex, PageRecord};
pub use progress::{EventChannel, SyncEvent, SyncReporter};
pub use session::{SyncReport, Synchronizer, PLACEHOLDER_BODY};
pub use storage::Tree;

// Test modules
#[cfg(test)]
mod integration_tests;

//! Content-store client library for pagesync.
//!
//! Wire types, the [`ContentStore`] trait consumed by the sync engine, a
//! REST implementation ([`RestStore`]) and an in-memory implementation
//! ([`MemoryStore`]) for tests and demos.

pub mod error;
pub mod memory;
pub mod rest;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use rest::{Auth, RestStore};
pub use store::ContentStore;
pub use types::{Attachment, Page, PageAncestor, PageExpand, UpdatePage};

pub use bytes::Bytes;

//! rollguard-state — embedded state store for rollguard.
//!
//! Backed by [redb](https://docs.rs/redb), holds the read models the
//! rollback monitor works from: deployment reports, per-application
//! rollback settings, instance reports, and the archive of finished
//! monitoring sessions.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{application_id}/{deployment_id}`,
//! `{application_id}/{deployment_id}:{instance_id}`) enable prefix scans for
//! related records. Application and deployment ids are rejected on write when
//! they contain a key separator, so one application's prefix never matches
//! another's.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

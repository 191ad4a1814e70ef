//! Uploads Service
//!
//! Content-addressed media storage in front of one or more S3-compatible
//! regions and a PostgreSQL catalog. Uploads are authorized by short-lived
//! capability tokens, stored once per content hash and bucket, and served back
//! with long-lived caching and read failover to the region they were written to.
//!
//! ## Features
//!
//! - **Deduplication**: identical bytes in a bucket share one physical object;
//!   every upload still gets its own catalog row
//! - **Reference-Counted Deletion**: an object is removed from every region
//!   once the last row pointing at it is gone
//! - **Previews**: bounded renditions of image attachments, computed once and
//!   cached in their own bucket
//! - **Lifecycle**: uploads never claimed by a resource are swept after a
//!   grace period
//! - **Moderation**: blocked hashes are rejected, and auto-ban hashes report
//!   the uploader over Kafka
//!
//! ## Architecture
//!
//! ```text
//!  HTTP (axum)                         Kafka
//! ┌──────────────┐                   ┌──────────────┐
//! │ Upload /     │                   │ uploads      │
//! │ Download /   │                   │ events       │
//! │ Internal     │                   └──────────────┘
//! └──────────────┘                          │
//!        │                                  ▼
//!        ▼                           ┌──────────────┐
//! ┌──────────────┐   sweeps          │ Event        │
//! │ Content      │◀──────────────────│ Handler      │
//! │ Store        │◀───┐              └──────────────┘
//! └──────────────┘    │              ┌──────────────┐
//!    │        │       └──────────────│ Lifecycle    │
//!    ▼        ▼                      │ Manager      │
//! ┌───────┐ ┌───────────────┐        └──────────────┘
//! │Catalog│ │ Region Router │──▶ S3 (primary, fallbacks)
//! └───────┘ └───────────────┘
//! ```

pub mod admin;
pub mod api;
pub mod blocklist;
pub mod catalog;
pub mod config;
pub mod content_store;
pub mod error;
pub mod events;
pub mod files;
pub mod lifecycle;
pub mod memory;
pub mod moderation;
pub mod object_store;
pub mod preview;
pub mod purge;
pub mod regions;
pub mod tasks;
pub mod token;
pub mod transcoder;

pub use admin::{AdminService, ClaimedFile};
pub use api::AppState;
pub use catalog::{Catalog, PgCatalog};
pub use config::Config;
pub use content_store::{ContentStore, NewFile};
pub use error::{AuthError, StorageError, TranscodeError, UploadsError};
pub use events::{EventHandler, UploadsEvent, UploadsEventConsumer};
pub use files::{Bucket, File};
pub use lifecycle::{LifecycleHandle, LifecycleManager, SweepReport};
pub use object_store::{ObjectStore, S3ObjectStore};
pub use regions::{Region, RegionRouter};
pub use token::{TokenClaims, TokenScope, TokenVerifier};
pub use transcoder::{ImageTranscoder, MediaTranscoder};

//! Foundation types for the driftfs content cache.
//!
//! This crate provides the identifier, state, and metadata types shared by
//! every other driftfs crate. Every other driftfs crate depends on
//! `driftfs-types`.
//!
//! # Key Types
//!
//! - [`ContentId`] — Opaque byte handle naming one logical file's payload
//! - [`SliceId`] — 36-character ASCII identifier for a single cached write
//! - [`CacheState`] — Per-entry lifecycle state with a legal-transition table
//! - [`SliceState`] — Per-slice durability state as persisted in the log
//! - [`MultipartContext`] — Bookkeeping for an in-progress streaming upload
//! - [`BlockRef`] — Reference from a slice to a content block

pub mod error;
pub mod id;
pub mod multipart;
pub mod slice;
pub mod state;

pub use error::TypeError;
pub use id::ContentId;
pub use multipart::MultipartContext;
pub use slice::{BlockRef, SliceId};
pub use state::{CacheState, SliceState};

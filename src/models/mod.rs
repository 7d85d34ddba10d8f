//! Core data models for the image resizer.
//!
//! Buckets and objects describe what the local object store persists; the
//! remaining types describe what flows through a single resize invocation.

pub mod bucket;
pub mod event;
pub mod metadata;
pub mod object;
pub mod sizes;

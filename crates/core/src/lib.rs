//! `kpcyber-core` — shared building blocks for the catalog backend.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{FeatureId, PlanId, ServiceId};

//! # metal-provider-id
//!
//! External machine identifiers for the metal machine driver.
//!
//! The orchestrator persists exactly one string per machine to correlate it
//! with the infrastructure instance backing it. This crate owns that string.
//!
//! ## ID Format
//!
//! `metal:///{partition}/{instance_id}`
//!
//! Examples:
//! - `metal:///fra-equ01/00000000-0000-0000-0000-ac1f6b7befb2`
//! - `metal:///nbg-w8101/c2a7f6e0-6f2e-11ea-8000-e0d55e2f4a1b`
//!
//! The format is persisted by orchestrators and must never change once
//! deployed. Partitions may not contain `/`; instance ids may, since the
//! partition ends at the first separator after the scheme.

mod error;
mod types;

pub use error::IdError;
pub use types::*;

//! Bellrock Core Library
//!
//! This crate provides the identifier and record types, the anonymous-ID
//! codec, and the cell-tower lookup map shared by the Bellrock server
//! components.
//!
//! # Modules
//!
//! - [`types`]: Identifier and record types (Uid, Aid, UserLocation, ...)
//! - [`codec`]: AID anonymization and trial decryption
//! - [`towers`]: Read-only cell-tower → coarse-location map
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod towers;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

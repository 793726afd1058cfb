//! Bellrock persistent storage
//!
//! Two sled-backed databases: the main relational store (users, peers,
//! observations, location history) and a segregated key store whose rows are
//! encrypted at rest under an operator-supplied master key.

pub mod keystore;
pub mod store;

pub use keystore::{Keystore, KeystoreError, MasterKey};
pub use store::{Store, StoreError};

//! Shared foundation for the Kestrel range store: identifiers, hybrid-logical
//! timestamps, key spans, work classes, the error taxonomy, and the cluster
//! settings registry.

pub mod error;
pub mod hlc;
pub mod settings;
pub mod types;

//! # dirauth-core
//!
//! Shared foundation for the dirauth realm engine:
//!
//! - Error taxonomy with transient/permanent classification
//! - Core value types (`User`, `Principal`, `DelegatedCredential`)
//! - Pluggable credential matchers resolved from a fixed registry

pub mod error;
pub mod matcher;
pub mod types;

// Re-exports
pub use error::{RealmError, RealmResult};
pub use matcher::{matcher_for, Argon2Matcher, CredentialMatcher, PlaintextMatcher};
pub use types::{DelegatedCredential, Principal, User};

//! # Directory Realm
//!
//! Directory-backed authentication and authorization engine.
//!
//! Given a username and a credential, the realm resolves the user's entry in
//! an external directory service, verifies the credential against that entry
//! (or by binding as the user) and computes the user's full role set,
//! including transitive nested group memberships.
//!
//! ## Features
//!
//! - User lookup by DN pattern templates or directory search
//! - Credential verification by bind-as-user or attribute comparison
//! - Nested group resolution (memberOf closure), cycle safe
//! - Connection pooling with endpoint failover and retry-once on
//!   transient directory errors
//! - SSL/TLS and STARTTLS
//! - Delegated-credential principal lookup for upstream SPNEGO layers
//!
//! ## Example
//!
//! ```ignore
//! use dirauth_realm::{Realm, RealmConfig};
//!
//! let config = RealmConfig::new("ldap://ds.example.com:389")
//!     .with_service_identity("cn=svc,dc=example,dc=com", "secret")
//!     .with_user_search("ou=people,dc=example,dc=com", "(uid={0})")
//!     .with_role_search("ou=groups,dc=example,dc=com", "(member={0})", "cn");
//!
//! let realm = Realm::new(config)?;
//! realm.start().await;
//!
//! if let Some(principal) = realm.authenticate("jdoe", "password").await {
//!     println!("{} has roles {:?}", principal.name, principal.roles);
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod escape;
pub mod pattern;
pub mod realm;
pub mod tls;

mod credential;
mod roles;
mod user;

#[cfg(test)]
mod testing;

// Re-exports
pub use client::{
    AttributeMap, BindOutcome, DirectoryConnection, DirectoryConnector, DirectoryEntry,
    LdapDirectory, SearchOutcome, SearchScope,
};
pub use config::{CompiledConfig, RealmConfig};
pub use connection::{ActiveConnection, ConnectionManager, DirectoryHandle};
pub use realm::Realm;

pub use dirauth_core::{DelegatedCredential, Principal, RealmError, RealmResult, User};

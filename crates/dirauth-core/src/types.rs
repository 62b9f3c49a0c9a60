//! Core value types shared between the realm engine and its callers.

use serde::{Deserialize, Serialize};

/// A user entry resolved from the directory.
///
/// Constructed fresh for every resolution attempt and never mutated. The
/// distinguished name is always already attribute-value escaped: it either
/// came back from the directory or was produced by escaped template
/// substitution.
#[derive(Clone)]
pub struct User {
    username: String,
    dn: String,
    password: Option<String>,
    roles: Vec<String>,
    user_role_id: Option<String>,
}

impl User {
    /// Create a new user record.
    pub fn new(
        username: impl Into<String>,
        dn: impl Into<String>,
        password: Option<String>,
        roles: Vec<String>,
        user_role_id: Option<String>,
    ) -> Self {
        Self {
            username: username.into(),
            dn: dn.into(),
            password,
            roles,
            user_role_id,
        }
    }

    /// The name the user presented to the authentication process (unescaped).
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The user's distinguished name, directory-escaped.
    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// The stored or backfilled credential, if any.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Roles embedded in the user's directory entry. Never null, may be empty.
    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Value of the configured role-id attribute, if any.
    pub fn user_role_id(&self) -> Option<&str> {
        self.user_role_id.as_deref()
    }

    /// Copy of this user with the given credential inserted. Used when no
    /// password attribute is configured but the presented credential may be
    /// needed for role searches performed as the user.
    #[must_use]
    pub fn with_password(&self, password: impl Into<String>) -> Self {
        Self {
            username: self.username.clone(),
            dn: self.dn.clone(),
            password: Some(password.into()),
            roles: self.roles.clone(),
            user_role_id: self.user_role_id.clone(),
        }
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("username", &self.username)
            .field("dn", &self.dn)
            .field("password", &self.password.as_ref().map(|_| "***REDACTED***"))
            .field("roles", &self.roles)
            .field("user_role_id", &self.user_role_id)
            .finish()
    }
}

/// An opaque delegated credential handed down by an upstream SPNEGO/GSSAPI
/// layer. The realm only carries it into the directory bind environment and
/// back out on the resulting principal; it never inspects the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct DelegatedCredential(Vec<u8>);

impl DelegatedCredential {
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self(token.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for DelegatedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DelegatedCredential({} bytes)", self.0.len())
    }
}

/// The outcome of a successful authentication or principal lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// The authenticated user name as presented.
    pub name: String,

    /// Complete role set: entry roles, common role and searched group roles.
    pub roles: Vec<String>,

    /// Delegated credential carried through from an upstream SPNEGO layer.
    #[serde(skip)]
    pub delegated: Option<DelegatedCredential>,
}

impl Principal {
    pub fn new(name: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            name: name.into(),
            roles,
            delegated: None,
        }
    }

    #[must_use]
    pub fn with_delegated(mut self, credential: DelegatedCredential) -> Self {
        self.delegated = Some(credential);
        self
    }

    /// Check role membership.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

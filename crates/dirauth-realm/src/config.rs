//! Realm configuration
//!
//! Configuration types for the directory-backed realm: endpoints, the
//! service bind identity, user and role search parameters, TLS options and
//! the pooling/retry switches.
//!
//! A validated [`RealmConfig`] is compiled into an immutable
//! [`CompiledConfig`] snapshot (templates parsed, TLS connector resolved).
//! Connection handles are built from a snapshot and keep it for their whole
//! lifetime; reconfiguration swaps the active snapshot and retires old
//! handles instead of mutating them.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dirauth_core::{RealmError, RealmResult};

use crate::pattern::{parse_user_pattern_list, Template};
use crate::tls;

/// Configuration for the directory realm.
#[derive(Clone, Serialize, Deserialize)]
pub struct RealmConfig {
    /// Primary directory endpoint (e.g. "ldap://ds1.example.com:389").
    pub connection_url: String,

    /// Failover endpoint tried once when the primary cannot be opened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternate_url: Option<String>,

    /// Directory client driver, resolved from the driver registry.
    #[serde(default = "default_context_factory")]
    pub context_factory: String,

    /// Service bind DN used for searches. Anonymous bind when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,

    /// Service bind password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_password: Option<String>,

    /// Bind mechanism: "none", "simple" or "gssapi". Inferred from the
    /// service identity when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,

    /// Security protocol; "ssl" forces an ldaps endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Referral handling: "ignore" or "throw".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrals: Option<String>,

    /// Alias dereference mode: "never", "searching", "finding" or "always".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deref_aliases: Option<String>,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Read timeout in milliseconds, applied per directory operation.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Base entry for user searches.
    #[serde(default)]
    pub user_base: String,

    /// Filter template for locating a user by search; `{0}` is the username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_search: Option<String>,

    /// Search the whole subtree below the user base instead of one level.
    #[serde(default)]
    pub user_subtree: bool,

    /// DN template or parenthesized list of DN templates for locating a user
    /// directly; `{0}` is the username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_pattern: Option<String>,

    /// Perform the user search bound as the user being searched for.
    #[serde(default)]
    pub user_search_as_user: bool,

    /// Attribute holding the user's password. When set, credentials are
    /// verified by attribute comparison instead of binding as the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_password: Option<String>,

    /// Attribute of the user entry holding role names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_role_name: Option<String>,

    /// Attribute of the user entry substituted as `{2}` into role filters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_role_attribute: Option<String>,

    /// Base entry for role searches; may contain `{N}` slots filled from the
    /// components of the user's DN.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_base: Option<String>,

    /// Filter template for role searches; `{0}` is the user DN, `{1}` the
    /// username and `{2}` the role-id attribute value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_search: Option<String>,

    /// Attribute of a group entry holding the role name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,

    /// Search the whole subtree below the role base instead of one level.
    #[serde(default)]
    pub role_subtree: bool,

    /// Close role membership transitively over nested groups.
    #[serde(default)]
    pub role_nested: bool,

    /// Perform role searches bound as the authenticated user.
    #[serde(default)]
    pub role_search_as_user: bool,

    /// Role granted to every successfully authenticated user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_role: Option<String>,

    /// Server-side search size limit; 0 means unlimited.
    #[serde(default)]
    pub size_limit: i32,

    /// Server-side search time limit in seconds; 0 means unlimited.
    #[serde(default)]
    pub time_limit: i32,

    /// Number of pooled connections. 1 selects a single mutex-guarded
    /// connection instead of a pool.
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: usize,

    /// Upgrade freshly opened connections to TLS via STARTTLS.
    #[serde(default)]
    pub use_starttls: bool,

    /// Comma-separated cipher suite list handed to the TLS provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipher_suites: Option<String>,

    /// Minimum TLS protocol version (e.g. "TLSv1.2").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_protocol: Option<String>,

    /// Hostname verification mode: "default" or "allow-all".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname_verifier: Option<String>,

    /// TLS connector provider, resolved from the provider registry.
    #[serde(default = "default_tls_provider")]
    pub tls_provider: String,

    /// Use a delegated credential from an upstream SPNEGO layer for
    /// principal lookups when one is supplied.
    #[serde(default = "default_true")]
    pub use_delegated_credential: bool,

    /// SASL quality-of-protection requested for delegated binds.
    #[serde(default = "default_spnego_qop")]
    pub spnego_delegation_qop: String,

    /// Suppress partial-result errors from directories that return them for
    /// unfollowed referrals (Active Directory compatibility).
    #[serde(default)]
    pub ad_compat: bool,

    /// Normalize every directory-returned DN through the hex-escape
    /// normalizer before use.
    #[serde(default)]
    pub force_dn_hex_escape: bool,

    /// Credential matcher used for attribute comparison, resolved from the
    /// matcher registry.
    #[serde(default = "default_credential_matcher")]
    pub credential_matcher: String,
}

fn default_context_factory() -> String {
    "ldap".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_pool_size() -> usize {
    1
}

fn default_tls_provider() -> String {
    "native".to_string()
}

fn default_true() -> bool {
    true
}

fn default_spnego_qop() -> String {
    "auth".to_string()
}

fn default_credential_matcher() -> String {
    "plaintext".to_string()
}

impl std::fmt::Debug for RealmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealmConfig")
            .field("connection_url", &self.connection_url)
            .field("alternate_url", &self.alternate_url)
            .field("context_factory", &self.context_factory)
            .field("connection_name", &self.connection_name)
            .field(
                "connection_password",
                &self.connection_password.as_ref().map(|_| "***REDACTED***"),
            )
            .field("authentication", &self.authentication)
            .field("user_base", &self.user_base)
            .field("user_search", &self.user_search)
            .field("user_pattern", &self.user_pattern)
            .field("user_password", &self.user_password)
            .field("role_base", &self.role_base)
            .field("role_search", &self.role_search)
            .field("role_name", &self.role_name)
            .field("role_nested", &self.role_nested)
            .field("connection_pool_size", &self.connection_pool_size)
            .field("use_starttls", &self.use_starttls)
            .field("ad_compat", &self.ad_compat)
            .finish_non_exhaustive()
    }
}

/// Effective bind mechanism for the service identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMode {
    Anonymous,
    Simple,
    Gssapi,
}

/// Referral handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Referrals {
    Ignore,
    Throw,
}

/// Alias dereference mode, mapped onto the driver's search options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasDeref {
    Never,
    Searching,
    Finding,
    Always,
}

impl RealmConfig {
    /// Create a config with the required endpoint; everything else defaults.
    pub fn new(connection_url: impl Into<String>) -> Self {
        Self {
            connection_url: connection_url.into(),
            alternate_url: None,
            context_factory: default_context_factory(),
            connection_name: None,
            connection_password: None,
            authentication: None,
            protocol: None,
            referrals: None,
            deref_aliases: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            user_base: String::new(),
            user_search: None,
            user_subtree: false,
            user_pattern: None,
            user_search_as_user: false,
            user_password: None,
            user_role_name: None,
            user_role_attribute: None,
            role_base: None,
            role_search: None,
            role_name: None,
            role_subtree: false,
            role_nested: false,
            role_search_as_user: false,
            common_role: None,
            size_limit: 0,
            time_limit: 0,
            connection_pool_size: default_pool_size(),
            use_starttls: false,
            cipher_suites: None,
            ssl_protocol: None,
            hostname_verifier: None,
            tls_provider: default_tls_provider(),
            use_delegated_credential: default_true(),
            spnego_delegation_qop: default_spnego_qop(),
            ad_compat: false,
            force_dn_hex_escape: false,
            credential_matcher: default_credential_matcher(),
        }
    }

    /// Set the service bind identity.
    pub fn with_service_identity(
        mut self,
        name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.connection_name = Some(name.into());
        self.connection_password = Some(password.into());
        self
    }

    /// Set the user search filter template.
    pub fn with_user_search(mut self, base: impl Into<String>, filter: impl Into<String>) -> Self {
        self.user_base = base.into();
        self.user_search = Some(filter.into());
        self
    }

    /// Set the user DN pattern (or parenthesized pattern list).
    pub fn with_user_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.user_pattern = Some(pattern.into());
        self
    }

    /// Set the role search parameters.
    pub fn with_role_search(
        mut self,
        base: impl Into<String>,
        filter: impl Into<String>,
        role_name: impl Into<String>,
    ) -> Self {
        self.role_base = Some(base.into());
        self.role_search = Some(filter.into());
        self.role_name = Some(role_name.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> RealmResult<()> {
        if self.connection_url.is_empty() {
            return Err(RealmError::configuration("connection_url is required"));
        }

        if self.connection_pool_size == 0 {
            return Err(RealmError::configuration(
                "connection_pool_size must be at least 1",
            ));
        }

        match self.authentication.as_deref() {
            None | Some("none") | Some("simple") | Some("gssapi") => {}
            Some(other) => {
                return Err(RealmError::configuration(format!(
                    "unknown authentication mode: {other}"
                )))
            }
        }

        match self.protocol.as_deref() {
            None | Some("ssl") => {}
            Some(other) => {
                return Err(RealmError::configuration(format!(
                    "unknown security protocol: {other}"
                )))
            }
        }

        match self.referrals.as_deref() {
            None | Some("ignore") | Some("throw") => {}
            Some("follow") => {
                return Err(RealmError::configuration(
                    "referral chasing is not supported by the directory driver",
                ))
            }
            Some(other) => {
                return Err(RealmError::configuration(format!(
                    "unknown referral mode: {other}"
                )))
            }
        }

        match self.deref_aliases.as_deref() {
            None | Some("never") | Some("searching") | Some("finding") | Some("always") => {}
            Some(other) => {
                return Err(RealmError::configuration(format!(
                    "unknown alias dereference mode: {other}"
                )))
            }
        }

        match self.hostname_verifier.as_deref() {
            None | Some("default") | Some("allow-all") => {}
            Some(other) => {
                return Err(RealmError::configuration(format!(
                    "unknown hostname verifier: {other}"
                )))
            }
        }

        Ok(())
    }

    /// Effective bind mechanism for the service identity.
    pub fn authentication_mode(&self) -> AuthenticationMode {
        match self.authentication.as_deref() {
            Some("none") => AuthenticationMode::Anonymous,
            Some("simple") => AuthenticationMode::Simple,
            Some("gssapi") => AuthenticationMode::Gssapi,
            _ => {
                if self.connection_name.is_some() {
                    AuthenticationMode::Simple
                } else {
                    AuthenticationMode::Anonymous
                }
            }
        }
    }

    /// Effective referral handling.
    pub fn referral_mode(&self) -> Referrals {
        match self.referrals.as_deref() {
            Some("throw") => Referrals::Throw,
            _ => Referrals::Ignore,
        }
    }

    /// Effective alias dereference mode.
    pub fn alias_deref(&self) -> AliasDeref {
        match self.deref_aliases.as_deref() {
            Some("never") => AliasDeref::Never,
            Some("searching") => AliasDeref::Searching,
            Some("finding") => AliasDeref::Finding,
            _ => AliasDeref::Always,
        }
    }

    /// Cipher suite names, split from the comma-separated option.
    pub fn cipher_suite_list(&self) -> Vec<String> {
        self.cipher_suites
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Attribute ids fetched along with a user entry.
    pub fn user_attr_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(attr) = &self.user_password {
            ids.push(attr.clone());
        }
        if let Some(attr) = &self.user_role_name {
            ids.push(attr.clone());
        }
        if let Some(attr) = &self.user_role_attribute {
            ids.push(attr.clone());
        }
        ids
    }

    /// Rewrite an endpoint for the configured security protocol.
    fn endpoint_url(&self, url: &str) -> String {
        if self.protocol.as_deref() == Some("ssl") {
            if let Some(rest) = url.strip_prefix("ldap://") {
                return format!("ldaps://{rest}");
            }
        }
        url.to_string()
    }
}

/// Which endpoint an open attempt targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Primary,
    Alternate,
}

/// Everything the directory driver needs to open one connection.
#[derive(Clone)]
pub struct ConnectionEnvironment {
    pub url: String,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
    pub authentication: AuthenticationMode,
    pub referrals: Referrals,
    pub alias_deref: AliasDeref,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub size_limit: i32,
    pub time_limit: i32,
    pub use_starttls: bool,
    pub tls: Option<native_tls::TlsConnector>,
}

impl ConnectionEnvironment {
    /// Build the environment for one open attempt against the given endpoint.
    pub fn for_endpoint(compiled: &CompiledConfig, endpoint: Endpoint) -> RealmResult<Self> {
        let config = &compiled.config;
        let url = match endpoint {
            Endpoint::Primary => config.endpoint_url(&config.connection_url),
            Endpoint::Alternate => {
                let alternate = config.alternate_url.as_deref().ok_or_else(|| {
                    RealmError::configuration("no alternate_url configured for failover")
                })?;
                config.endpoint_url(alternate)
            }
        };

        Ok(Self {
            url,
            bind_dn: config.connection_name.clone(),
            bind_password: config.connection_password.clone(),
            authentication: config.authentication_mode(),
            referrals: config.referral_mode(),
            alias_deref: config.alias_deref(),
            connect_timeout: Duration::from_millis(config.connection_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            size_limit: config.size_limit,
            time_limit: config.time_limit,
            use_starttls: config.use_starttls,
            tls: compiled.tls.clone(),
        })
    }
}

/// An immutable configuration snapshot with its compiled templates and
/// resolved TLS material. Connection handles reference one snapshot for
/// their whole lifetime.
pub struct CompiledConfig {
    pub config: RealmConfig,
    pub user_search: Option<Template>,
    pub user_patterns: Option<Vec<Template>>,
    pub role_base: Option<Template>,
    pub role_search: Option<Template>,
    pub tls: Option<native_tls::TlsConnector>,
}

impl CompiledConfig {
    /// Validate and compile a configuration into a snapshot.
    pub fn compile(config: RealmConfig) -> RealmResult<Arc<Self>> {
        config.validate()?;

        let user_search = config
            .user_search
            .as_deref()
            .map(Template::compile)
            .transpose()?;

        let user_patterns = config
            .user_pattern
            .as_deref()
            .map(|raw| {
                parse_user_pattern_list(raw)?
                    .iter()
                    .map(|p| Template::compile(p))
                    .collect::<RealmResult<Vec<_>>>()
            })
            .transpose()?;

        let role_base = config
            .role_base
            .as_deref()
            .map(Template::compile)
            .transpose()?;

        let role_search = config
            .role_search
            .as_deref()
            .map(Template::compile)
            .transpose()?;

        let tls = tls::resolve_connector(&config)?;

        Ok(Arc::new(Self {
            config,
            user_search,
            user_patterns,
            role_base,
            role_search,
            tls,
        }))
    }
}

impl std::fmt::Debug for CompiledConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledConfig")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

//! Directory client boundary.
//!
//! The realm engine talks to the directory through the two traits in this
//! module; everything above them (resolution, verification, role closure,
//! pooling, retry) is driver-agnostic. [`LdapDirectory`] is the stock driver
//! backed by `ldap3`. Drivers are resolved by name from a fixed registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ldap3::{DerefAliases, LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchOptions};
use tracing::{debug, info, warn};

use dirauth_core::{DelegatedCredential, RealmError, RealmResult};

use crate::config::{AliasDeref, AuthenticationMode, ConnectionEnvironment, Referrals};

/// Attribute id to values, as returned by the directory.
pub type AttributeMap = HashMap<String, Vec<String>>;

/// One entry delivered by a search.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attrs: AttributeMap,
}

/// A drained search result. `partial` marks result sets the server cut short
/// for unfollowed referrals; the caller decides whether that is tolerable.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub entries: Vec<DirectoryEntry>,
    pub partial: bool,
}

/// Search scope relative to the base entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    OneLevel,
    Subtree,
}

/// Result of a bind attempt with explicit credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    InvalidCredentials,
}

/// One live, bound connection to the directory. Not thread safe; ownership
/// is serialized by the connection manager.
#[async_trait]
pub trait DirectoryConnection: Send {
    /// Re-bind this connection under the given identity. An empty DN and
    /// password is an anonymous bind.
    async fn simple_bind(&mut self, dn: &str, password: &str) -> RealmResult<BindOutcome>;

    /// Bind using a delegated credential from an upstream SPNEGO layer.
    async fn bind_delegated(
        &mut self,
        credential: &DelegatedCredential,
        qop: Option<&str>,
    ) -> RealmResult<()>;

    /// Execute a search and drain its results.
    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
    ) -> RealmResult<SearchOutcome>;

    /// Fetch attributes of a single entry by DN. `Ok(None)` when the entry
    /// does not exist.
    async fn get_attributes(
        &mut self,
        dn: &str,
        attrs: &[String],
    ) -> RealmResult<Option<AttributeMap>>;

    /// Close the connection, releasing any TLS session with it.
    async fn close(&mut self) -> RealmResult<()>;
}

/// Opens connections from an environment of protocol options.
#[async_trait]
pub trait DirectoryConnector: std::fmt::Debug + Send + Sync {
    async fn connect(
        &self,
        env: &ConnectionEnvironment,
    ) -> RealmResult<Box<dyn DirectoryConnection>>;
}

/// Resolve a directory driver by its configured name.
pub fn connector_for(name: &str) -> RealmResult<Arc<dyn DirectoryConnector>> {
    match name {
        "ldap" => Ok(Arc::new(LdapDirectory)),
        other => Err(RealmError::configuration(format!(
            "unknown directory driver: {other}"
        ))),
    }
}

/// The stock LDAP driver.
#[derive(Debug)]
pub struct LdapDirectory;

#[async_trait]
impl DirectoryConnector for LdapDirectory {
    async fn connect(
        &self,
        env: &ConnectionEnvironment,
    ) -> RealmResult<Box<dyn DirectoryConnection>> {
        debug!(url = %env.url, starttls = env.use_starttls, "Connecting to directory server");

        let mut settings = LdapConnSettings::new()
            .set_conn_timeout(env.connect_timeout)
            .set_starttls(env.use_starttls);
        if let Some(connector) = &env.tls {
            settings = settings.set_connector(connector.clone());
        }

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &env.url)
            .await
            .map_err(|e| {
                RealmError::connect_failed_with_source(
                    format!("failed to connect to directory server at {}", env.url),
                    e,
                )
            })?;

        // Spawn the connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "directory connection driver error");
            }
        });

        match env.authentication {
            AuthenticationMode::Anonymous => {}
            AuthenticationMode::Simple => {
                let bind_dn = env.bind_dn.as_deref().unwrap_or("");
                let bind_password = env.bind_password.as_deref().unwrap_or("");

                debug!(bind_dn = %bind_dn, "Performing service bind");
                let result = ldap.simple_bind(bind_dn, bind_password).await.map_err(|e| {
                    RealmError::connect_failed_with_source(
                        format!("service bind failed for {bind_dn}"),
                        e,
                    )
                })?;
                if result.rc != 0 {
                    return Err(RealmError::connect_failed(format!(
                        "service bind failed with result code {}: {}",
                        result.rc, result.text
                    )));
                }
            }
            AuthenticationMode::Gssapi => {
                return Err(RealmError::unsupported(
                    "gssapi service binds are not supported by the ldap driver",
                ));
            }
        }

        info!(url = %env.url, "Directory connection established");

        Ok(Box::new(LdapConnection {
            ldap,
            env: env.clone(),
        }))
    }
}

struct LdapConnection {
    ldap: ldap3::Ldap,
    env: ConnectionEnvironment,
}

impl LdapConnection {
    fn search_options(&self) -> SearchOptions {
        let deref = match self.env.alias_deref {
            AliasDeref::Never => DerefAliases::Never,
            AliasDeref::Searching => DerefAliases::Searching,
            AliasDeref::Finding => DerefAliases::Finding,
            AliasDeref::Always => DerefAliases::Always,
        };
        SearchOptions::new()
            .sizelimit(self.env.size_limit)
            .timelimit(self.env.time_limit)
            .deref(deref)
    }

    fn entry_from(raw: ldap3::ResultEntry) -> DirectoryEntry {
        let entry = SearchEntry::construct(raw);
        let mut attrs: AttributeMap = entry.attrs;
        // Binary attribute values are carried through as lossy text; the
        // realm only consumes textual attributes.
        for (name, values) in entry.bin_attrs {
            attrs.entry(name).or_default().extend(
                values
                    .into_iter()
                    .map(|v| String::from_utf8_lossy(&v).into_owned()),
            );
        }
        DirectoryEntry {
            dn: entry.dn,
            attrs,
        }
    }

    /// Map a non-zero result code shared by search-like operations.
    fn classify(&self, rc: u32, text: &str) -> RealmResult<bool> {
        match rc {
            0 => Ok(false),
            // partialResults, or a referral while referral chasing is off
            9 => Ok(true),
            10 if self.env.referrals == Referrals::Ignore => Ok(true),
            48 | 49 | 50 => Err(RealmError::auth_rejected(format!(
                "result code {rc}: {text}"
            ))),
            rc => Err(RealmError::directory(format!(
                "operation failed with result code {rc}: {text}"
            ))),
        }
    }
}

#[async_trait]
impl DirectoryConnection for LdapConnection {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> RealmResult<BindOutcome> {
        let result = self
            .ldap
            .with_timeout(self.env.read_timeout)
            .simple_bind(dn, password)
            .await
            .map_err(|e| RealmError::directory_with_source("bind failed", e))?;

        match result.rc {
            0 => Ok(BindOutcome::Bound),
            48 | 49 => Ok(BindOutcome::InvalidCredentials),
            rc => Err(RealmError::directory(format!(
                "bind failed with result code {rc}: {}",
                result.text
            ))),
        }
    }

    async fn bind_delegated(
        &mut self,
        _credential: &DelegatedCredential,
        _qop: Option<&str>,
    ) -> RealmResult<()> {
        // Delegated credentials are consumed at this boundary; the stock
        // driver has no SASL/GSSAPI support, so only custom drivers can
        // honor them.
        Err(RealmError::unsupported(
            "delegated credential binds are not supported by the ldap driver",
        ))
    }

    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
    ) -> RealmResult<SearchOutcome> {
        let scope = match scope {
            SearchScope::OneLevel => Scope::OneLevel,
            SearchScope::Subtree => Scope::Subtree,
        };
        let attrs: Vec<&str> = attrs.iter().map(String::as_str).collect();

        debug!(base = %base, filter = %filter, "Searching directory");

        let ldap3::SearchResult(raw_entries, res) = self
            .ldap
            .with_search_options(self.search_options())
            .with_timeout(self.env.read_timeout)
            .search(base, scope, filter, attrs)
            .await
            .map_err(|e| RealmError::directory_with_source("search failed", e))?;

        let partial = self.classify(res.rc, &res.text)?;
        let entries = raw_entries.into_iter().map(Self::entry_from).collect();

        Ok(SearchOutcome { entries, partial })
    }

    async fn get_attributes(
        &mut self,
        dn: &str,
        attrs: &[String],
    ) -> RealmResult<Option<AttributeMap>> {
        let attrs: Vec<&str> = attrs.iter().map(String::as_str).collect();

        let ldap3::SearchResult(raw_entries, res) = self
            .ldap
            .with_timeout(self.env.read_timeout)
            .search(dn, Scope::Base, "(objectClass=*)", attrs)
            .await
            .map_err(|e| RealmError::directory_with_source("attribute fetch failed", e))?;

        if res.rc == 32 {
            // noSuchObject: the composed DN does not exist
            return Ok(None);
        }
        self.classify(res.rc, &res.text)?;

        Ok(raw_entries
            .into_iter()
            .next()
            .map(|raw| Self::entry_from(raw).attrs))
    }

    async fn close(&mut self) -> RealmResult<()> {
        self.ldap
            .unbind()
            .await
            .map_err(|e| RealmError::directory_with_source("unbind failed", e))
    }
}

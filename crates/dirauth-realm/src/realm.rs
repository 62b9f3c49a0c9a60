//! The realm orchestrator.
//!
//! [`Realm`] composes connection management, user resolution, credential
//! verification and role resolution into the public authentication surface.
//! Any number of tasks may call into one realm concurrently; the connection
//! manager serializes access to the underlying connections.
//!
//! A directory error mid-sequence closes the current connection, drains idle
//! pooled siblings and retries the whole sequence exactly once on a fresh
//! connection. No failure of any kind surfaces to the caller as an error:
//! the caller sees an absent principal, operators see the detail in the logs.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use dirauth_core::{
    matcher_for, CredentialMatcher, DelegatedCredential, Principal, RealmError, RealmResult, User,
};

use crate::client::{connector_for, DirectoryConnector};
use crate::config::{CompiledConfig, RealmConfig};
use crate::connection::{ActiveConnection, ConnectionManager};
use crate::credential::{check_credentials, restore_service_bind};
use crate::roles::resolve_roles;
use crate::user::get_user;

/// A directory-backed authentication and authorization realm.
pub struct Realm {
    manager: ConnectionManager,
    matcher: Arc<dyn CredentialMatcher>,
}

/// Result of driving one DN template.
enum PatternOutcome {
    /// No entry under this template; the next template may still match.
    NotFound,
    /// An entry was resolved but the credential did not verify. Final.
    Rejected,
    Authenticated(Principal),
}

impl Realm {
    /// Create a realm from a configuration, resolving the directory driver
    /// and credential matcher from their registries.
    pub fn new(config: RealmConfig) -> RealmResult<Self> {
        let connector = connector_for(&config.context_factory)?;
        Self::with_connector(config, connector)
    }

    /// Create a realm over a custom directory driver.
    pub fn with_connector(
        config: RealmConfig,
        connector: Arc<dyn DirectoryConnector>,
    ) -> RealmResult<Self> {
        let matcher = matcher_for(&config.credential_matcher)?;
        let snapshot = CompiledConfig::compile(config)?;
        Ok(Self {
            manager: ConnectionManager::new(connector, snapshot),
            matcher,
        })
    }

    /// Open a connection eagerly so the first authentication does not pay
    /// the connect cost. Best effort: a failure is logged and the realm
    /// stays usable, reconnecting lazily.
    pub async fn start(&self) {
        match self.manager.acquire().await {
            Ok(conn) => {
                self.manager.release(conn).await;
                debug!("eager directory connection established");
            }
            Err(err) => {
                warn!(error = %err, "eager directory connection failed, will connect lazily");
            }
        }
    }

    /// Close every connection held by the realm.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }

    /// Swap the active configuration. In-flight operations finish under the
    /// snapshot they started with; handles built from earlier snapshots are
    /// retired on their next checkout. The pooling mode is fixed at realm
    /// creation, so a pool size change requires a new realm.
    pub async fn reconfigure(&self, config: RealmConfig) -> RealmResult<()> {
        let snapshot = CompiledConfig::compile(config)?;
        self.manager.reconfigure(snapshot).await;
        info!("realm configuration replaced");
        Ok(())
    }

    /// Authenticate a username and credential against the directory.
    ///
    /// Returns the principal with its full role set on success, and `None`
    /// for every failure mode: unknown user, wrong credentials, ambiguous
    /// match, or a directory fault that persisted across the retry.
    #[instrument(skip(self, credentials))]
    pub async fn authenticate(&self, username: &str, credentials: &str) -> Option<Principal> {
        if username.is_empty() || credentials.is_empty() {
            debug!("empty username or credentials");
            return None;
        }

        let outcome = match self.run_authenticate(username, credentials).await {
            Err(err) if err.is_transient() => {
                info!(error = %err, "directory error, retrying once on a fresh connection");
                self.run_authenticate(username, credentials).await
            }
            outcome => outcome,
        };

        match outcome {
            Ok(principal) => principal,
            Err(err) => {
                warn!(error = %err, username, "authentication failed");
                None
            }
        }
    }

    /// Look up a principal without verifying a credential, optionally
    /// performing the directory work under a delegated credential from an
    /// upstream SPNEGO layer.
    #[instrument(skip(self, delegated))]
    pub async fn resolve_principal(
        &self,
        username: &str,
        delegated: Option<&DelegatedCredential>,
    ) -> Option<Principal> {
        if username.is_empty() {
            return None;
        }

        let outcome = match self.run_principal(username, delegated).await {
            Err(err) if err.is_transient() => {
                info!(error = %err, "directory error, retrying once on a fresh connection");
                self.run_principal(username, delegated).await
            }
            outcome => outcome,
        };

        match outcome {
            Ok(principal) => principal,
            Err(err) => {
                warn!(error = %err, username, "principal lookup failed");
                None
            }
        }
    }

    /// Fetch the stored password attribute for a username. Only available
    /// when a password attribute is configured.
    pub async fn lookup_stored_credential(&self, username: &str) -> Option<String> {
        let snapshot = self.manager.current_snapshot().await;
        snapshot.config.user_password.as_ref()?;
        if username.is_empty() {
            return None;
        }

        let outcome = match self.run_stored_credential(username).await {
            Err(err) if err.is_transient() => {
                info!(error = %err, "directory error, retrying once on a fresh connection");
                self.run_stored_credential(username).await
            }
            outcome => outcome,
        };

        match outcome {
            Ok(password) => password,
            Err(err) => {
                warn!(error = %err, username, "stored credential lookup failed");
                None
            }
        }
    }

    /// Close out one attempt: release the connection on success, discard it
    /// and drain idle siblings on any error, since they may share the fault.
    async fn finish_attempt<T>(
        &self,
        conn: ActiveConnection,
        outcome: RealmResult<T>,
    ) -> RealmResult<T> {
        match outcome {
            Ok(value) => {
                self.manager.release(conn).await;
                Ok(value)
            }
            Err(err) => {
                self.manager.discard(conn).await;
                self.manager.drain().await;
                Err(err)
            }
        }
    }

    async fn run_authenticate(
        &self,
        username: &str,
        credentials: &str,
    ) -> RealmResult<Option<Principal>> {
        let mut conn = self.manager.acquire().await?;
        let outcome =
            Self::authenticate_on(&mut conn, &self.matcher, username, credentials).await;
        self.finish_attempt(conn, outcome).await
    }

    async fn run_principal(
        &self,
        username: &str,
        delegated: Option<&DelegatedCredential>,
    ) -> RealmResult<Option<Principal>> {
        let mut conn = self.manager.acquire().await?;
        let outcome = Self::principal_on(&mut conn, username, delegated).await;
        self.finish_attempt(conn, outcome).await
    }

    async fn run_stored_credential(&self, username: &str) -> RealmResult<Option<String>> {
        let mut conn = self.manager.acquire().await?;
        let outcome = get_user(&mut conn, username, None, None)
            .await
            .map(|user| user.and_then(|u| u.password().map(str::to_string)));
        self.finish_attempt(conn, outcome).await
    }

    /// Resolve, verify and authorize on one connection.
    async fn authenticate_on(
        conn: &mut ActiveConnection,
        matcher: &Arc<dyn CredentialMatcher>,
        username: &str,
        credentials: &str,
    ) -> RealmResult<Option<Principal>> {
        let snapshot = conn.snapshot.clone();
        let Some(pattern_count) = snapshot.user_patterns.as_ref().map(Vec::len) else {
            let Some(user) = get_user(conn, username, Some(credentials), None).await? else {
                return Ok(None);
            };
            return Self::verify_and_authorize(conn, matcher, &user, credentials).await;
        };

        for index in 0..pattern_count {
            match Self::attempt_pattern(conn, matcher, username, credentials, index).await {
                Ok(PatternOutcome::NotFound) => continue,
                Ok(PatternOutcome::Rejected) => return Ok(None),
                Ok(PatternOutcome::Authenticated(principal)) => return Ok(Some(principal)),
                // A username can compose an illegal name with one template
                // and a legal one with the next.
                Err(RealmError::InvalidName { name }) => {
                    info!(username, name = %name, "pattern produced an invalid name, trying next");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Drive one DN template. A user backed by an actual directory entry
    /// whose credential fails is rejected outright; when no attributes are
    /// fetched the record is only a composed DN, so a failed bind there is
    /// indistinguishable from "not found" and the next template is tried.
    async fn attempt_pattern(
        conn: &mut ActiveConnection,
        matcher: &Arc<dyn CredentialMatcher>,
        username: &str,
        credentials: &str,
        index: usize,
    ) -> RealmResult<PatternOutcome> {
        let resolved_from_entry = !conn.snapshot.config.user_attr_ids().is_empty();

        let Some(user) = get_user(conn, username, Some(credentials), Some(index)).await? else {
            return Ok(PatternOutcome::NotFound);
        };

        match Self::verify_and_authorize(conn, matcher, &user, credentials).await? {
            Some(principal) => Ok(PatternOutcome::Authenticated(principal)),
            None if resolved_from_entry => {
                debug!(dn = %user.dn(), "credential rejected for resolved entry");
                Ok(PatternOutcome::Rejected)
            }
            None => Ok(PatternOutcome::NotFound),
        }
    }

    async fn verify_and_authorize(
        conn: &mut ActiveConnection,
        matcher: &Arc<dyn CredentialMatcher>,
        user: &User,
        credentials: &str,
    ) -> RealmResult<Option<Principal>> {
        if !check_credentials(conn, user, credentials, matcher.as_ref()).await? {
            return Ok(None);
        }
        let roles = resolve_roles(conn, user).await?;
        Ok(Some(Principal::new(user.username(), roles)))
    }

    async fn lookup_principal(
        conn: &mut ActiveConnection,
        username: &str,
    ) -> RealmResult<Option<Principal>> {
        let Some(user) = get_user(conn, username, None, None).await? else {
            return Ok(None);
        };
        let roles = resolve_roles(conn, &user).await?;
        Ok(Some(Principal::new(user.username(), roles)))
    }

    /// Look up a user and their roles without credential verification. With
    /// a delegated credential the directory work runs under it, and the
    /// service bind identity is restored unconditionally afterwards.
    async fn principal_on(
        conn: &mut ActiveConnection,
        username: &str,
        delegated: Option<&DelegatedCredential>,
    ) -> RealmResult<Option<Principal>> {
        let snapshot = conn.snapshot.clone();
        let config = &snapshot.config;

        let delegated = delegated.filter(|_| config.use_delegated_credential);
        let Some(credential) = delegated else {
            return Self::lookup_principal(conn, username).await;
        };

        conn.connection()?
            .bind_delegated(credential, Some(&config.spnego_delegation_qop))
            .await?;

        let outcome = Self::lookup_principal(conn, username).await;
        let restored = restore_service_bind(conn).await;
        let principal = outcome?;
        restored?;

        Ok(principal.map(|p| p.with_delegated(credential.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDirectory;

    fn search_realm_config() -> RealmConfig {
        RealmConfig::new("ldap://ds:389")
            .with_user_search("ou=people,dc=ex", "(uid={0})")
            .with_role_search("ou=groups,dc=ex", "(member={0})", "cn")
    }

    fn populate(mock: &MockDirectory) {
        mock.add_entry(
            "cn=jdoe,ou=people,dc=ex",
            &[("uid", &["jdoe"]), ("description", &["staff"])],
        );
        mock.set_password("cn=jdoe,ou=people,dc=ex", "secret");
        mock.add_entry(
            "cn=admins,ou=groups,dc=ex",
            &[("cn", &["admins"]), ("member", &["cn=jdoe,ou=people,dc=ex"])],
        );
    }

    fn realm(mock: &MockDirectory, config: RealmConfig) -> Realm {
        Realm::with_connector(config, mock.connector()).unwrap()
    }

    #[tokio::test]
    async fn test_authenticate_by_search_and_bind() {
        let mock = MockDirectory::new();
        populate(&mock);

        let mut config = search_realm_config();
        config.user_role_name = Some("description".to_string());
        config.common_role = Some("everyone".to_string());
        let realm = realm(&mock, config);

        let principal = realm.authenticate("jdoe", "secret").await.unwrap();
        assert_eq!(principal.name, "jdoe");
        assert_eq!(principal.roles, ["staff", "everyone", "admins"]);
    }

    #[tokio::test]
    async fn test_wrong_credentials_yield_absent() {
        let mock = MockDirectory::new();
        populate(&mock);

        let realm = realm(&mock, search_realm_config());
        assert!(realm.authenticate("jdoe", "wrong").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_user_yields_absent() {
        let mock = MockDirectory::new();
        populate(&mock);

        let realm = realm(&mock, search_realm_config());
        assert!(realm.authenticate("nobody", "secret").await.is_none());
    }

    #[tokio::test]
    async fn test_empty_inputs_yield_absent() {
        let mock = MockDirectory::new();
        populate(&mock);

        let realm = realm(&mock, search_realm_config());
        assert!(realm.authenticate("", "secret").await.is_none());
        assert!(realm.authenticate("jdoe", "").await.is_none());
        // Nothing was even attempted against the directory
        assert_eq!(mock.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_attribute_comparison_authentication() {
        let mock = MockDirectory::new();
        mock.add_entry(
            "cn=jdoe,ou=people,dc=ex",
            &[("uid", &["jdoe"]), ("userPassword", &["stored-pw"])],
        );

        let mut config = search_realm_config();
        config.user_password = Some("userPassword".to_string());
        let realm = realm(&mock, config);

        assert!(realm.authenticate("jdoe", "stored-pw").await.is_some());
        assert!(realm.authenticate("jdoe", "wrong").await.is_none());
        // Verification went through the matcher, never through a bind
        assert!(mock.bind_log().is_empty());
    }

    #[tokio::test]
    async fn test_pattern_fallthrough_on_not_found_only() {
        let mock = MockDirectory::new();
        // jdoe exists only under the second template
        mock.add_entry(
            "cn=jdoe,ou=users,dc=ex",
            &[("userPassword", &["secret"])],
        );
        // root exists under both templates with different passwords
        mock.add_entry(
            "cn=root,ou=admins,dc=ex",
            &[("userPassword", &["admins-pw"])],
        );
        mock.add_entry(
            "cn=root,ou=users,dc=ex",
            &[("userPassword", &["users-pw"])],
        );

        let mut config = RealmConfig::new("ldap://ds:389")
            .with_user_pattern("(cn={0},ou=admins,dc=ex)(cn={0},ou=users,dc=ex)");
        config.user_password = Some("userPassword".to_string());
        let realm = realm(&mock, config);

        // Not found under the first template falls through to the second
        let principal = realm.authenticate("jdoe", "secret").await.unwrap();
        assert_eq!(principal.name, "jdoe");

        // root resolves under the first template; the credential that only
        // matches the second template's entry must not be retried there
        assert!(realm.authenticate("root", "users-pw").await.is_none());
        assert!(realm.authenticate("root", "admins-pw").await.is_some());
    }

    #[tokio::test]
    async fn test_pattern_bind_without_attributes_tries_each_template() {
        let mock = MockDirectory::new();
        // Only the second template's DN exists as a bindable principal
        mock.set_password("cn=jdoe,ou=users,dc=ex", "secret");

        let config = RealmConfig::new("ldap://ds:389")
            .with_user_pattern("(cn={0},ou=admins,dc=ex)(cn={0},ou=users,dc=ex)");
        let realm = realm(&mock, config);

        // No attributes are fetched, so the first template's failed bind is
        // indistinguishable from "not found" and the second is tried
        let principal = realm.authenticate("jdoe", "secret").await.unwrap();
        assert_eq!(principal.name, "jdoe");

        assert!(realm.authenticate("jdoe", "wrong").await.is_none());
    }

    #[tokio::test]
    async fn test_transient_error_retried_once() {
        let mock = MockDirectory::new();
        populate(&mock);
        mock.fail_operations(1);

        let realm = realm(&mock, search_realm_config());
        let principal = realm.authenticate("jdoe", "secret").await.unwrap();
        assert_eq!(principal.name, "jdoe");
        assert_eq!(principal.roles, ["admins"]);

        // The broken connection was replaced by a fresh one
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_error_twice_yields_absent() {
        let mock = MockDirectory::new();
        populate(&mock);
        mock.fail_operations(2);

        let realm = realm(&mock, search_realm_config());
        assert!(realm.authenticate("jdoe", "secret").await.is_none());
        // Both broken connections were discarded
        assert_eq!(mock.open_connections(), 0);

        // A later attempt recovers on a fresh connection
        let principal = realm.authenticate("jdoe", "secret").await.unwrap();
        assert_eq!(principal.name, "jdoe");
    }

    #[tokio::test]
    async fn test_retry_drains_pooled_siblings() {
        let mock = MockDirectory::new();
        populate(&mock);

        let mut config = search_realm_config();
        config.connection_pool_size = 3;
        let realm = realm(&mock, config);

        // Park two idle connections in the pool
        let a = realm.manager.acquire().await.unwrap();
        let b = realm.manager.acquire().await.unwrap();
        realm.manager.release(a).await;
        realm.manager.release(b).await;
        assert_eq!(mock.open_connections(), 2);

        mock.fail_operations(1);
        let principal = realm.authenticate("jdoe", "secret").await.unwrap();
        assert_eq!(principal.name, "jdoe");

        // The faulted connection and its idle siblings are gone; only the
        // fresh retry connection survives
        assert_eq!(mock.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_yields_absent() {
        let mock = MockDirectory::new();
        populate(&mock);
        mock.fail_url("ldap://ds:389");

        let realm = realm(&mock, search_realm_config());
        assert!(realm.authenticate("jdoe", "secret").await.is_none());
    }

    #[tokio::test]
    async fn test_start_is_best_effort() {
        let mock = MockDirectory::new();
        populate(&mock);
        mock.fail_url("ldap://ds:389");

        let realm = realm(&mock, search_realm_config());
        realm.start().await;

        // The failed eager open does not poison the realm
        mock.clear_failures();
        assert!(realm.authenticate("jdoe", "secret").await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let mock = MockDirectory::new();
        populate(&mock);

        let realm = realm(&mock, search_realm_config());
        realm.start().await;
        assert_eq!(mock.open_connections(), 1);

        realm.shutdown().await;
        assert_eq!(mock.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_reconfigure_takes_effect_for_new_work() {
        let mock = MockDirectory::new();
        populate(&mock);
        mock.add_entry("cn=jdoe,ou=staff,dc=ex", &[("uid", &["jdoe"])]);
        mock.set_password("cn=jdoe,ou=staff,dc=ex", "other-pw");

        let realm = realm(&mock, search_realm_config());
        assert!(realm.authenticate("jdoe", "secret").await.is_some());

        realm
            .reconfigure(
                RealmConfig::new("ldap://ds:389").with_user_search("ou=staff,dc=ex", "(uid={0})"),
            )
            .await
            .unwrap();

        assert!(realm.authenticate("jdoe", "secret").await.is_none());
        assert!(realm.authenticate("jdoe", "other-pw").await.is_some());
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_invalid_config() {
        let mock = MockDirectory::new();
        let realm = realm(&mock, search_realm_config());

        let err = realm.reconfigure(RealmConfig::new("")).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }

    #[tokio::test]
    async fn test_resolve_principal_without_credentials() {
        let mock = MockDirectory::new();
        populate(&mock);

        let realm = realm(&mock, search_realm_config());
        let principal = realm.resolve_principal("jdoe", None).await.unwrap();
        assert_eq!(principal.name, "jdoe");
        assert_eq!(principal.roles, ["admins"]);
        assert!(principal.delegated.is_none());

        assert!(realm.resolve_principal("nobody", None).await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_principal_with_delegated_credential() {
        let mock = MockDirectory::new();
        populate(&mock);
        mock.allow_delegated(true);

        let realm = realm(&mock, search_realm_config());
        let credential = DelegatedCredential::new(b"ticket".to_vec());

        let principal = realm
            .resolve_principal("jdoe", Some(&credential))
            .await
            .unwrap();
        assert_eq!(principal.delegated, Some(credential));

        // The delegated bind ran and the service identity was restored
        let binds = mock.bind_log();
        assert!(binds.contains(&"<delegated>".to_string()));
        assert_eq!(binds.last().map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_delegated_credential_ignored_when_disabled() {
        let mock = MockDirectory::new();
        populate(&mock);

        let mut config = search_realm_config();
        config.use_delegated_credential = false;
        let realm = realm(&mock, config);

        let credential = DelegatedCredential::new(b"ticket".to_vec());
        let principal = realm
            .resolve_principal("jdoe", Some(&credential))
            .await
            .unwrap();
        assert!(principal.delegated.is_none());
        assert!(!mock.bind_log().contains(&"<delegated>".to_string()));
    }

    #[tokio::test]
    async fn test_lookup_stored_credential() {
        let mock = MockDirectory::new();
        mock.add_entry(
            "cn=jdoe,ou=people,dc=ex",
            &[("uid", &["jdoe"]), ("userPassword", &["stored-pw"])],
        );

        // Only available when a password attribute is configured
        {
            let realm = realm(&mock, search_realm_config());
            assert!(realm.lookup_stored_credential("jdoe").await.is_none());
        }

        let mut config = search_realm_config();
        config.user_password = Some("userPassword".to_string());
        let realm = realm(&mock, config);
        assert_eq!(
            realm.lookup_stored_credential("jdoe").await.as_deref(),
            Some("stored-pw")
        );
        assert!(realm.lookup_stored_credential("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_authentication_with_pool() {
        let mock = MockDirectory::new();
        populate(&mock);

        let mut config = search_realm_config();
        config.connection_pool_size = 4;
        let realm = Arc::new(realm(&mock, config));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let realm = realm.clone();
            handles.push(tokio::spawn(
                async move { realm.authenticate("jdoe", "secret").await },
            ));
        }
        for handle in handles {
            let principal = handle.await.unwrap().unwrap();
            assert_eq!(principal.roles, ["admins"]);
        }
    }

    #[tokio::test]
    async fn test_unknown_registry_identifiers_rejected() {
        let mut config = search_realm_config();
        config.context_factory = "jndi".to_string();
        assert!(Realm::new(config).is_err());

        let mock = MockDirectory::new();
        let mut config = search_realm_config();
        config.credential_matcher = "md5".to_string();
        assert!(Realm::with_connector(config, mock.connector()).is_err());
    }
}

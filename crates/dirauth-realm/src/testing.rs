//! In-memory directory used by the unit tests.
//!
//! Implements the client boundary over a scripted entry set so resolution,
//! verification, role closure and the retry/failover policies can be
//! exercised without a live server. Filter handling is deliberately minimal:
//! a single `(attr=value)` comparison, which is all the engine's formatted
//! filters reduce to in tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use dirauth_core::{DelegatedCredential, RealmError, RealmResult};

use crate::client::{
    AttributeMap, BindOutcome, DirectoryConnection, DirectoryConnector, DirectoryEntry,
    SearchOutcome, SearchScope,
};
use crate::config::{AuthenticationMode, ConnectionEnvironment};
use crate::escape::filter_escape;

#[derive(Debug, Default)]
struct MockState {
    entries: BTreeMap<String, AttributeMap>,
    passwords: HashMap<String, String>,
    require_self_read: HashSet<String>,
    failing_urls: HashSet<String>,
    fail_ops: u32,
    partial: bool,
    allow_delegated: bool,
    connected_urls: Vec<String>,
    connect_count: usize,
    open_connections: usize,
    binds: Vec<String>,
}

/// Handle to the scripted directory shared by every connection it spawns.
#[derive(Clone, Default)]
pub struct MockDirectory {
    state: Arc<Mutex<MockState>>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn DirectoryConnector> {
        Arc::new(MockConnector {
            state: self.state.clone(),
        })
    }

    /// Register an entry with its attributes.
    pub fn add_entry(&self, dn: &str, attrs: &[(&str, &[&str])]) {
        let map: AttributeMap = attrs
            .iter()
            .map(|(name, values)| {
                (
                    (*name).to_string(),
                    values.iter().map(|v| (*v).to_string()).collect(),
                )
            })
            .collect();
        self.state
            .lock()
            .unwrap()
            .entries
            .insert(dn.to_string(), map);
    }

    /// Register the password accepted for a bind principal.
    pub fn set_password(&self, principal: &str, password: &str) {
        self.state
            .lock()
            .unwrap()
            .passwords
            .insert(principal.to_string(), password.to_string());
    }

    /// Make attribute reads of `dn` succeed only while bound as `dn`.
    pub fn require_self_read(&self, dn: &str) {
        self.state
            .lock()
            .unwrap()
            .require_self_read
            .insert(dn.to_string());
    }

    /// Make every connect attempt against `url` fail.
    pub fn fail_url(&self, url: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_urls
            .insert(url.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_urls.clear();
        state.fail_ops = 0;
    }

    /// Fail the next `n` search or attribute-fetch operations.
    pub fn fail_operations(&self, n: u32) {
        self.state.lock().unwrap().fail_ops = n;
    }

    /// Mark every search outcome as partial.
    pub fn set_partial(&self, partial: bool) {
        self.state.lock().unwrap().partial = partial;
    }

    /// Accept delegated-credential binds.
    pub fn allow_delegated(&self, allow: bool) {
        self.state.lock().unwrap().allow_delegated = allow;
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connect_count
    }

    pub fn connected_urls(&self) -> Vec<String> {
        self.state.lock().unwrap().connected_urls.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().unwrap().open_connections
    }

    /// Every principal passed to a bind, in order, across all connections.
    pub fn bind_log(&self) -> Vec<String> {
        self.state.lock().unwrap().binds.clone()
    }
}

#[derive(Debug)]
struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl DirectoryConnector for MockConnector {
    async fn connect(
        &self,
        env: &ConnectionEnvironment,
    ) -> RealmResult<Box<dyn DirectoryConnection>> {
        let mut state = self.state.lock().unwrap();
        state.connected_urls.push(env.url.clone());

        if state.failing_urls.contains(&env.url) {
            return Err(RealmError::connect_failed(format!(
                "refused connection to {}",
                env.url
            )));
        }

        let mut bound = String::new();
        if env.authentication == AuthenticationMode::Simple {
            let dn = env.bind_dn.clone().unwrap_or_default();
            let password = env.bind_password.clone().unwrap_or_default();
            state.binds.push(dn.clone());
            let accepted = state.passwords.get(&dn).is_some_and(|p| *p == password);
            if !accepted {
                return Err(RealmError::connect_failed(format!(
                    "service bind rejected for {dn}"
                )));
            }
            bound = dn;
        }

        state.connect_count += 1;
        state.open_connections += 1;

        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            bound,
            closed: false,
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
    bound: String,
    closed: bool,
}

fn dn_in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
    if base.is_empty() {
        return true;
    }
    let dn = dn.to_ascii_lowercase();
    let base = base.to_ascii_lowercase();
    if dn == base {
        return scope == SearchScope::Subtree;
    }
    match dn.strip_suffix(&format!(",{base}")) {
        Some(prefix) => match scope {
            SearchScope::Subtree => true,
            SearchScope::OneLevel => !prefix.contains(','),
        },
        None => false,
    }
}

fn parse_simple_filter(filter: &str) -> Option<(String, String)> {
    let inner = filter.strip_prefix('(')?.strip_suffix(')')?;
    let (attr, value) = inner.split_once('=')?;
    Some((attr.to_string(), value.to_string()))
}

impl MockConnection {
    fn take_injected_failure(&self) -> Option<RealmError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_ops > 0 {
            state.fail_ops -= 1;
            Some(RealmError::directory("injected directory failure"))
        } else {
            None
        }
    }
}

#[async_trait]
impl DirectoryConnection for MockConnection {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> RealmResult<BindOutcome> {
        let mut state = self.state.lock().unwrap();
        state.binds.push(dn.to_string());

        if dn.is_empty() {
            self.bound = String::new();
            return Ok(BindOutcome::Bound);
        }

        if state.passwords.get(dn).is_some_and(|p| p == password) {
            self.bound = dn.to_string();
            Ok(BindOutcome::Bound)
        } else {
            Ok(BindOutcome::InvalidCredentials)
        }
    }

    async fn bind_delegated(
        &mut self,
        _credential: &DelegatedCredential,
        _qop: Option<&str>,
    ) -> RealmResult<()> {
        let mut state = self.state.lock().unwrap();
        state.binds.push("<delegated>".to_string());
        if state.allow_delegated {
            self.bound = "<delegated>".to_string();
            Ok(())
        } else {
            Err(RealmError::unsupported("delegated binds disabled"))
        }
    }

    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
    ) -> RealmResult<SearchOutcome> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }

        let state = self.state.lock().unwrap();
        let (attr, wanted) = parse_simple_filter(filter).ok_or_else(|| {
            RealmError::directory(format!("mock cannot evaluate filter: {filter}"))
        })?;

        let mut entries = Vec::new();
        for (dn, entry_attrs) in &state.entries {
            if !dn_in_scope(dn, base, scope) {
                continue;
            }
            let matched = entry_attrs.get(&attr).is_some_and(|values| {
                values
                    .iter()
                    .any(|v| *v == wanted || filter_escape(v) == wanted)
            });
            if !matched {
                continue;
            }

            let selected: AttributeMap = if attrs.is_empty() {
                entry_attrs.clone()
            } else {
                entry_attrs
                    .iter()
                    .filter(|(name, _)| attrs.contains(*name))
                    .map(|(name, values)| (name.clone(), values.clone()))
                    .collect()
            };
            entries.push(DirectoryEntry {
                dn: dn.clone(),
                attrs: selected,
            });
        }

        Ok(SearchOutcome {
            entries,
            partial: state.partial,
        })
    }

    async fn get_attributes(
        &mut self,
        dn: &str,
        attrs: &[String],
    ) -> RealmResult<Option<AttributeMap>> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }

        let state = self.state.lock().unwrap();
        if state.require_self_read.contains(dn) && self.bound != dn {
            return Err(RealmError::auth_rejected(format!(
                "entry {dn} is only readable by itself"
            )));
        }

        Ok(state.entries.get(dn).map(|entry_attrs| {
            if attrs.is_empty() {
                entry_attrs.clone()
            } else {
                entry_attrs
                    .iter()
                    .filter(|(name, _)| attrs.contains(*name))
                    .map(|(name, values)| (name.clone(), values.clone()))
                    .collect()
            }
        }))
    }

    async fn close(&mut self) -> RealmResult<()> {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().open_connections -= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dn_in_scope() {
        assert!(dn_in_scope(
            "cn=a,ou=people,dc=ex",
            "ou=people,dc=ex",
            SearchScope::OneLevel
        ));
        assert!(!dn_in_scope(
            "cn=a,ou=nested,ou=people,dc=ex",
            "ou=people,dc=ex",
            SearchScope::OneLevel
        ));
        assert!(dn_in_scope(
            "cn=a,ou=nested,ou=people,dc=ex",
            "ou=people,dc=ex",
            SearchScope::Subtree
        ));
        assert!(!dn_in_scope("cn=a,dc=other", "ou=people,dc=ex", SearchScope::Subtree));
    }

    #[test]
    fn test_parse_simple_filter() {
        assert_eq!(
            parse_simple_filter("(uid=jdoe)"),
            Some(("uid".to_string(), "jdoe".to_string()))
        );
        assert_eq!(parse_simple_filter("uid=jdoe"), None);
    }
}

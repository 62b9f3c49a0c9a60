//! User resolution.
//!
//! Resolves a username to a [`User`] record either by formatting one of the
//! configured DN templates and fetching the entry directly, or by executing
//! a directory search. The optional password and role attributes are
//! retrieved in the same round trip.

use percent_encoding::percent_decode_str;
use tracing::{debug, info};
use url::Url;

use dirauth_core::{RealmError, RealmResult, User};

use crate::client::{AttributeMap, BindOutcome, SearchScope};
use crate::config::RealmConfig;
use crate::connection::DirectoryHandle;
use crate::credential::restore_service_bind;
use crate::escape::{attribute_value_escape, filter_escape, normalize_hex_escapes};
use crate::pattern::Template;

/// Resolve a username to a user record.
///
/// With `pattern_index` set, the DN template at that index is tried;
/// otherwise the configured search is executed. When no password attribute
/// is configured and the caller supplied a credential, the credential is
/// inserted into the resolved record since role searches performed as the
/// user will need it.
pub(crate) async fn get_user(
    handle: &mut DirectoryHandle,
    username: &str,
    credentials: Option<&str>,
    pattern_index: Option<usize>,
) -> RealmResult<Option<User>> {
    let snapshot = handle.snapshot.clone();
    let config = &snapshot.config;
    let attr_ids = config.user_attr_ids();

    let user = match (&snapshot.user_patterns, pattern_index) {
        (Some(patterns), Some(index)) => {
            let user =
                user_by_pattern(handle, username, credentials, &attr_ids, &patterns[index]).await?;
            debug!(username, found = user.is_some(), "user lookup by pattern");
            user
        }
        _ => {
            let as_user = config.user_search_as_user;
            if as_user {
                let conn = handle.connection()?;
                let outcome = conn.simple_bind(username, credentials.unwrap_or("")).await?;
                if outcome == BindOutcome::InvalidCredentials {
                    return Err(RealmError::auth_rejected(format!(
                        "impersonated user search bind rejected for {username}"
                    )));
                }
            }
            let outcome = user_by_search(handle, username, &attr_ids).await;
            let user = if as_user {
                let restored = restore_service_bind(handle).await;
                let user = outcome?;
                restored?;
                user
            } else {
                outcome?
            };
            debug!(username, found = user.is_some(), "user lookup by search");
            user
        }
    };

    if config.user_password.is_none() {
        if let (Some(credentials), Some(user)) = (credentials, &user) {
            return Ok(Some(user.with_password(credentials)));
        }
    }

    Ok(user)
}

/// Locate the user by formatting a DN template with the escaped username and
/// fetching the named attributes directly.
async fn user_by_pattern(
    handle: &mut DirectoryHandle,
    username: &str,
    credentials: Option<&str>,
    attr_ids: &[String],
    template: &Template,
) -> RealmResult<Option<User>> {
    // Escape in case the username contains a character with special meaning
    // in an attribute value.
    let dn = template.format(&[&attribute_value_escape(username)])?;

    if attr_ids.is_empty() {
        // No attributes requested, no need to look for them
        return Ok(Some(User::new(username, dn, None, Vec::new(), None)));
    }

    match fetch_user_attrs(handle, username, &dn, attr_ids).await {
        Err(RealmError::AuthenticationRejected { .. }) => {
            // Some directories only let an entry read its own attributes.
            // Retry the fetch bound as the candidate entry itself.
            debug!(dn = %dn, "attribute fetch rejected, retrying bound as the candidate");
            let conn = handle.connection()?;
            conn.simple_bind(&dn, credentials.unwrap_or("")).await?;

            let outcome = fetch_user_attrs(handle, username, &dn, attr_ids).await;
            let restored = restore_service_bind(handle).await;
            let user = outcome?;
            restored?;
            Ok(user)
        }
        other => other,
    }
}

async fn fetch_user_attrs(
    handle: &mut DirectoryHandle,
    username: &str,
    dn: &str,
    attr_ids: &[String],
) -> RealmResult<Option<User>> {
    let snapshot = handle.snapshot.clone();
    let config = &snapshot.config;

    let conn = handle.connection()?;
    let Some(attrs) = conn.get_attributes(dn, attr_ids).await? else {
        return Ok(None);
    };

    Ok(Some(build_user(config, username, dn.to_string(), &attrs)))
}

/// Locate the user by executing the configured search. Exactly one result is
/// expected: none resolves as absent, more than one is ambiguous and also
/// resolves as absent.
async fn user_by_search(
    handle: &mut DirectoryHandle,
    username: &str,
    attr_ids: &[String],
) -> RealmResult<Option<User>> {
    let snapshot = handle.snapshot.clone();
    let config = &snapshot.config;
    let Some(template) = &snapshot.user_search else {
        return Ok(None);
    };

    // Escape in case the username contains a character with special meaning
    // in a search filter.
    let filter = template.format(&[&filter_escape(username)])?;
    let scope = if config.user_subtree {
        SearchScope::Subtree
    } else {
        SearchScope::OneLevel
    };

    let conn = handle.connection()?;
    let outcome = conn
        .search(&config.user_base, scope, &filter, attr_ids)
        .await?;
    if outcome.partial && !config.ad_compat {
        return Err(RealmError::PartialResult);
    }

    let mut entries = outcome.entries;
    match entries.len() {
        0 => Ok(None),
        1 => {
            let entry = entries.remove(0);
            let dn = entry_dn(config, &entry.dn)?;
            debug!(username, dn = %dn, "entry found");
            Ok(Some(build_user(config, username, dn, &entry.attrs)))
        }
        matches => {
            info!(username, matches, "username matched multiple entries");
            Ok(None)
        }
    }
}

fn build_user(config: &RealmConfig, username: &str, dn: String, attrs: &AttributeMap) -> User {
    let password = config
        .user_password
        .as_deref()
        .and_then(|id| attribute_value(attrs, id));
    let user_role_id = config
        .user_role_attribute
        .as_deref()
        .and_then(|id| attribute_value(attrs, id));
    let roles = config
        .user_role_name
        .as_deref()
        .map(|id| attribute_values(attrs, id))
        .unwrap_or_default();

    User::new(username, dn, password, roles, user_role_id)
}

/// First value of the named attribute.
pub(crate) fn attribute_value(attrs: &AttributeMap, attr_id: &str) -> Option<String> {
    attrs.get(attr_id).and_then(|values| values.first().cloned())
}

/// All values of the named attribute.
pub(crate) fn attribute_values(attrs: &AttributeMap, attr_id: &str) -> Vec<String> {
    attrs.get(attr_id).cloned().unwrap_or_default()
}

/// Normalize the distinguished name of a returned entry.
///
/// Search results are usually plain DNs, but referral-style absolute names
/// arrive as LDAP URLs whose path component carries the DN; a malformed
/// absolute name is a hard error. Optionally the whole name is pushed
/// through the hex-escape normalizer.
pub(crate) fn entry_dn(config: &RealmConfig, raw: &str) -> RealmResult<String> {
    let dn = if raw.starts_with("ldap://") || raw.starts_with("ldaps://") {
        let url = Url::parse(raw).map_err(|_| RealmError::invalid_name(raw))?;
        let path = url.path();
        if path.len() < 2 {
            // An absolute name is /{DN}; an empty path component is malformed
            return Err(RealmError::invalid_name(raw));
        }
        percent_decode_str(&path[1..])
            .decode_utf8()
            .map_err(|_| RealmError::invalid_name(raw))?
            .into_owned()
    } else {
        raw.to_string()
    };

    if config.force_dn_hex_escape {
        Ok(normalize_hex_escapes(&dn))
    } else {
        Ok(dn)
    }
}

//! Role resolution.
//!
//! Computes the final role set for a resolved user: roles embedded in the
//! user's entry, the configured common role, directly searched group roles
//! and, when nested resolution is enabled, the transitive closure over
//! nested group membership. Groups are collected into a map keyed by group
//! DN, which both deduplicates roles discovered through multiple search
//! paths and keeps the nested traversal cycle-safe.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use dirauth_core::{RealmError, RealmResult, User};

use crate::client::{BindOutcome, SearchScope};
use crate::config::CompiledConfig;
use crate::connection::DirectoryHandle;
use crate::credential::restore_service_bind;
use crate::escape::{attribute_value_escape, filter_escape, normalize_hex_escapes};
use crate::user::{attribute_value, entry_dn};

/// Resolve the complete role set for a user.
pub(crate) async fn resolve_roles(
    handle: &mut DirectoryHandle,
    user: &User,
) -> RealmResult<Vec<String>> {
    let snapshot = handle.snapshot.clone();
    let config = &snapshot.config;

    // Start with roles retrieved from the user entry
    let mut roles: Vec<String> = user.roles().to_vec();
    if let Some(common) = &config.common_role {
        roles.push(common.clone());
    }
    debug!(
        username = user.username(),
        count = roles.len(),
        "user internal roles collected"
    );

    let (Some(role_format), Some(role_name)) = (&snapshot.role_search, config.role_name.as_deref())
    else {
        return Ok(roles);
    };

    // The DN came back from the directory, so it is already attribute value
    // escaped; the username and role id are raw. All three end up inside a
    // filter, so everything gets filter escaped on top.
    let filter = role_format.format(&[
        &filter_escape(user.dn()),
        &filter_escape(&attribute_value_escape(user.username())),
        &filter_escape(&attribute_value_escape(user.user_role_id().unwrap_or(""))),
    ])?;

    let base = role_search_base(&snapshot, user.dn())?;
    let scope = if config.role_subtree {
        SearchScope::Subtree
    } else {
        SearchScope::OneLevel
    };

    let mut group_map: BTreeMap<String, String> = BTreeMap::new();
    for (dn, name) in search_groups(handle, user, &base, scope, &filter, role_name).await? {
        group_map.insert(dn, name);
    }
    debug!(
        username = user.username(),
        count = group_map.len(),
        "direct group roles collected"
    );

    // The memberOf algorithm: expand each newly found group into the groups
    // that list it as a member, until a round finds nothing new. A DN already
    // present in the map is never re-expanded, so cyclic membership
    // terminates.
    if config.role_nested {
        let mut frontier: Vec<(String, String)> = group_map
            .iter()
            .map(|(dn, name)| (dn.clone(), name.clone()))
            .collect();

        while !frontier.is_empty() {
            let mut next_round = Vec::new();

            for (group_dn, group_name) in &frontier {
                // The group DN is already value escaped, the name is not
                let escaped_name = filter_escape(&attribute_value_escape(group_name));
                let filter =
                    role_format.format(&[&filter_escape(group_dn), &escaped_name, &escaped_name])?;
                trace!(base = %base, filter = %filter, "nested group search");

                for (dn, name) in
                    search_groups(handle, user, &base, scope, &filter, role_name).await?
                {
                    if !group_map.contains_key(&dn) {
                        trace!(group = %dn, role = %name, "found nested role");
                        group_map.insert(dn.clone(), name.clone());
                        next_round.push((dn, name));
                    }
                }
            }

            frontier = next_round;
        }
    }

    roles.extend(group_map.into_values());
    Ok(roles)
}

/// Compute the base entry for role searches.
///
/// A role base template may reference the components of the user's DN, with
/// `{0}` being the rightmost component. Components may come back from the
/// directory with single-character escaping, so each is normalized to the
/// two-hex-digit form first.
fn role_search_base(snapshot: &CompiledConfig, dn: &str) -> RealmResult<String> {
    let Some(template) = &snapshot.role_base else {
        return Ok(String::new());
    };

    let components: Vec<String> = dn_components(dn)
        .iter()
        .map(|c| normalize_hex_escapes(c))
        .collect();
    let refs: Vec<&str> = components.iter().map(String::as_str).collect();
    template.format(&refs)
}

/// Split a DN into its components, rightmost first. A comma preceded by a
/// backslash belongs to the component value, not the structure.
fn dn_components(dn: &str) -> Vec<String> {
    let mut components = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for c in dn.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            current.push(c);
            escaped = true;
        } else if c == ',' {
            components.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(c);
        }
    }
    components.push(current.trim().to_string());

    components.reverse();
    components
}

/// Run one group search, optionally bound as the user, and return the
/// `(group DN, role name)` pairs it produced. The service bind identity is
/// restored unconditionally after an impersonated search.
async fn search_groups(
    handle: &mut DirectoryHandle,
    user: &User,
    base: &str,
    scope: SearchScope,
    filter: &str,
    role_name: &str,
) -> RealmResult<Vec<(String, String)>> {
    let as_user = handle.snapshot.config.role_search_as_user;

    if as_user {
        let conn = handle.connection()?;
        let outcome = conn
            .simple_bind(user.dn(), user.password().unwrap_or(""))
            .await?;
        if outcome == BindOutcome::InvalidCredentials {
            return Err(RealmError::auth_rejected(format!(
                "impersonated role search bind rejected for {}",
                user.dn()
            )));
        }
    }

    let outcome = run_group_search(handle, base, scope, filter, role_name).await;

    if as_user {
        let restored = restore_service_bind(handle).await;
        let groups = outcome?;
        restored?;
        Ok(groups)
    } else {
        outcome
    }
}

async fn run_group_search(
    handle: &mut DirectoryHandle,
    base: &str,
    scope: SearchScope,
    filter: &str,
    role_name: &str,
) -> RealmResult<Vec<(String, String)>> {
    let snapshot = handle.snapshot.clone();
    let config = &snapshot.config;
    let attrs = vec![role_name.to_string()];

    let conn = handle.connection()?;
    let outcome = conn.search(base, scope, filter, &attrs).await?;
    if outcome.partial && !config.ad_compat {
        return Err(RealmError::PartialResult);
    }

    let mut groups = Vec::new();
    for entry in outcome.entries {
        let dn = entry_dn(config, &entry.dn)?;
        if let Some(name) = attribute_value(&entry.attrs, role_name) {
            groups.push((dn, name));
        }
    }
    Ok(groups)
}

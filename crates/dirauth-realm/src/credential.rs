//! Credential verification.
//!
//! A resolved user is verified either by comparing the presented credential
//! against the password attribute fetched during resolution, or by binding
//! to the directory as the user. The selection rule: attribute comparison
//! if and only if a password attribute name is configured.

use tracing::debug;

use dirauth_core::{CredentialMatcher, RealmError, RealmResult, User};

use crate::client::BindOutcome;
use crate::connection::DirectoryHandle;

/// Check whether the user can be authenticated with the given credentials.
pub(crate) async fn check_credentials(
    handle: &mut DirectoryHandle,
    user: &User,
    credentials: &str,
    matcher: &dyn CredentialMatcher,
) -> RealmResult<bool> {
    let validated = if handle.snapshot.config.user_password.is_none() {
        bind_as_user(handle, user, credentials).await?
    } else {
        compare_credentials(matcher, user, credentials)
    };

    if validated {
        debug!(username = user.username(), "credentials validated");
    } else {
        debug!(username = user.username(), "credential validation failed");
    }
    Ok(validated)
}

/// Compare the presented credentials with those retrieved from the
/// directory, through the pluggable matcher.
fn compare_credentials(matcher: &dyn CredentialMatcher, user: &User, credentials: &str) -> bool {
    match user.password() {
        Some(stored) => matcher.matches(credentials, stored),
        None => false,
    }
}

/// Check credentials by binding to the directory as the user.
///
/// Bind-as-user always uses a simple bind, whatever mechanism the service
/// identity is configured with. The prior bind identity is restored
/// unconditionally afterwards.
async fn bind_as_user(
    handle: &mut DirectoryHandle,
    user: &User,
    credentials: &str,
) -> RealmResult<bool> {
    if credentials.is_empty() {
        return Ok(false);
    }

    debug!(dn = %user.dn(), "validating credentials by binding as the user");

    let outcome = {
        let conn = handle.connection()?;
        conn.simple_bind(user.dn(), credentials).await
    };
    let restored = restore_service_bind(handle).await;
    let outcome = outcome?;
    restored?;

    Ok(outcome == BindOutcome::Bound)
}

/// Re-establish the service bind identity, or an anonymous bind when no
/// service identity is configured.
pub(crate) async fn restore_service_bind(handle: &mut DirectoryHandle) -> RealmResult<()> {
    let snapshot = handle.snapshot.clone();
    let config = &snapshot.config;

    let dn = config.connection_name.clone().unwrap_or_default();
    let password = config.connection_password.clone().unwrap_or_default();

    let conn = handle.connection()?;
    match conn.simple_bind(&dn, &password).await? {
        BindOutcome::Bound => Ok(()),
        BindOutcome::InvalidCredentials => Err(RealmError::directory(
            "failed to restore the service bind identity",
        )),
    }
}

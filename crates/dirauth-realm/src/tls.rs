//! TLS connector resolution.
//!
//! Connections are optionally upgraded to TLS, either by scheme (ldaps) or
//! via STARTTLS after the plain connection is established. When the
//! configuration customizes the TLS layer, a [`native_tls::TlsConnector`] is
//! built once per configuration snapshot by a named provider and handed to
//! the directory driver; otherwise the driver's default negotiation applies.
//!
//! Providers are resolved from a fixed registry; an unknown provider name is
//! a configuration error.

use native_tls::{Protocol, TlsConnector};

use dirauth_core::{RealmError, RealmResult};

use crate::config::RealmConfig;

/// Build the TLS connector for a configuration snapshot, if the snapshot
/// customizes the TLS layer at all.
pub fn resolve_connector(config: &RealmConfig) -> RealmResult<Option<TlsConnector>> {
    let customized = config.ssl_protocol.is_some()
        || config.hostname_verifier.is_some()
        || config.cipher_suites.is_some();
    if !customized {
        return Ok(None);
    }

    match config.tls_provider.as_str() {
        "native" => native_provider(config).map(Some),
        other => Err(RealmError::configuration(format!(
            "unknown tls provider: {other}"
        ))),
    }
}

/// Default provider backed by the platform TLS implementation.
///
/// Honors the protocol floor and the hostname verification mode. Cipher
/// suite pinning is not expressible through the platform API, so a non-empty
/// suite list requires a provider that supports it.
fn native_provider(config: &RealmConfig) -> RealmResult<TlsConnector> {
    let ciphers = config.cipher_suite_list();
    if !ciphers.is_empty() {
        return Err(RealmError::configuration(
            "cipher suite pinning is not supported by the native tls provider",
        ));
    }

    let mut builder = TlsConnector::builder();

    if let Some(name) = config.ssl_protocol.as_deref() {
        builder.min_protocol_version(Some(parse_protocol(name)?));
    }

    if config.hostname_verifier.as_deref() == Some("allow-all") {
        builder.danger_accept_invalid_hostnames(true);
    }

    builder
        .build()
        .map_err(|e| RealmError::configuration(format!("failed to build tls connector: {e}")))
}

fn parse_protocol(name: &str) -> RealmResult<Protocol> {
    match name {
        "SSLv3" => Ok(Protocol::Sslv3),
        "TLSv1" | "TLSv1.0" => Ok(Protocol::Tlsv10),
        "TLSv1.1" => Ok(Protocol::Tlsv11),
        "TLSv1.2" => Ok(Protocol::Tlsv12),
        other => Err(RealmError::configuration(format!(
            "unknown ssl protocol: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_customization_yields_none() {
        let config = RealmConfig::new("ldap://ds.example.com");
        assert!(resolve_connector(&config).unwrap().is_none());
    }

    #[test]
    fn test_protocol_floor_builds() {
        let mut config = RealmConfig::new("ldap://ds.example.com");
        config.ssl_protocol = Some("TLSv1.2".to_string());
        assert!(resolve_connector(&config).unwrap().is_some());
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let mut config = RealmConfig::new("ldap://ds.example.com");
        config.ssl_protocol = Some("TLSv9".to_string());
        assert!(resolve_connector(&config).is_err());
    }

    #[test]
    fn test_allow_all_hostname_verifier_builds() {
        let mut config = RealmConfig::new("ldap://ds.example.com");
        config.hostname_verifier = Some("allow-all".to_string());
        assert!(resolve_connector(&config).unwrap().is_some());
    }

    #[test]
    fn test_cipher_suites_require_capable_provider() {
        let mut config = RealmConfig::new("ldap://ds.example.com");
        config.cipher_suites = Some("TLS_AES_128_GCM_SHA256".to_string());
        let err = resolve_connector(&config).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut config = RealmConfig::new("ldap://ds.example.com");
        config.tls_provider = "bespoke".to_string();
        config.ssl_protocol = Some("TLSv1.2".to_string());
        assert!(resolve_connector(&config).is_err());
    }
}

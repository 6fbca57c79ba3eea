//! Credential secret access for the metal machine driver.
//!
//! The orchestrator hands over a secret per call. Only four keys are read:
//!
//! ```text
//! metalAPIURL   endpoint of the infrastructure API (required)
//! metalAPIKey   bearer token        \ exactly one of the two
//! metalAPIHMac  HMAC shared secret  /
//! userData      cloud-init payload forwarded on allocation (optional)
//! ```
//!
//! Values are trimmed before use. Secret values never leave this crate in
//! `Debug` output; log [`Credentials::fingerprint`] instead.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Secret key holding the infrastructure API endpoint.
pub const URL_KEY: &str = "metalAPIURL";

/// Secret key holding the API token.
pub const TOKEN_KEY: &str = "metalAPIKey";

/// Secret key holding the HMAC secret.
pub const HMAC_KEY: &str = "metalAPIHMac";

/// Secret key holding the user data payload.
pub const USER_DATA_KEY: &str = "userData";

/// Credential errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialsError {
    /// One or more required secret fields are missing or conflicting.
    #[error("invalid credentials: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl CredentialsError {
    /// All violations, in the order they were detected.
    pub fn violations(&self) -> &[String] {
        match self {
            CredentialsError::Invalid(v) => v,
        }
    }
}

/// Raw secret data as supplied by the orchestrator.
///
/// Keys are stored in sorted order for deterministic display.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretData {
    inner: BTreeMap<String, Vec<u8>>,
}

impl SecretData {
    /// Create an empty secret.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, returning the previous one if the key existed.
    pub fn insert<K: Into<String>, V: Into<Vec<u8>>>(&mut self, key: K, value: V) -> Option<Vec<u8>> {
        self.inner.insert(key.into(), value.into())
    }

    /// Raw bytes for a key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.inner.get(key).map(Vec::as_slice)
    }

    /// Value for a key decoded as UTF-8 (lossy) and trimmed.
    ///
    /// Missing keys yield an empty string.
    pub fn get_trimmed(&self, key: &str) -> String {
        self.get(key)
            .map(|v| String::from_utf8_lossy(v).trim().to_string())
            .unwrap_or_default()
    }

    /// Check if a key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Get all keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(|k| k.as_str())
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Trimmed user data payload, empty when absent.
    pub fn user_data(&self) -> String {
        self.get_trimmed(USER_DATA_KEY)
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for SecretData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut data = Self::new();
        for (k, v) in iter {
            data.insert(k, v);
        }
        data
    }
}

impl std::fmt::Debug for SecretData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(redact_for_display(self)).finish()
    }
}

/// How the driver authenticates against the infrastructure API.
#[derive(Clone, PartialEq, Eq)]
pub enum ApiAuth {
    /// Bearer token.
    Token(String),
    /// HMAC shared secret.
    Hmac(String),
}

impl ApiAuth {
    /// Short name of the scheme, safe to log.
    pub fn scheme(&self) -> &'static str {
        match self {
            ApiAuth::Token(_) => "token",
            ApiAuth::Hmac(_) => "hmac",
        }
    }

    fn secret(&self) -> &str {
        match self {
            ApiAuth::Token(s) | ApiAuth::Hmac(s) => s,
        }
    }
}

impl std::fmt::Debug for ApiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}([REDACTED])", self.scheme())
    }
}

/// Validated credentials for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    endpoint: String,
    auth: ApiAuth,
}

impl Credentials {
    /// Build credentials from explicit values.
    pub fn new(endpoint: impl Into<String>, auth: ApiAuth) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth,
        }
    }

    /// Read and validate credentials from a secret.
    ///
    /// All violations are collected and reported together.
    pub fn from_secret(secret: &SecretData) -> Result<Self, CredentialsError> {
        let violations = validate_secret(secret);
        if !violations.is_empty() {
            return Err(CredentialsError::Invalid(violations));
        }

        let token = secret.get_trimmed(TOKEN_KEY);
        let hmac = secret.get_trimmed(HMAC_KEY);
        let auth = if token.is_empty() {
            ApiAuth::Hmac(hmac)
        } else {
            ApiAuth::Token(token)
        };

        Ok(Self {
            endpoint: secret.get_trimmed(URL_KEY),
            auth,
        })
    }

    /// Infrastructure API endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Authentication material.
    pub fn auth(&self) -> &ApiAuth {
        &self.auth
    }

    /// Stable, non-secret fingerprint for log correlation.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.endpoint.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.auth.scheme().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.auth.secret().as_bytes());
        let result = hasher.finalize();
        format!("sha256:{}", hex::encode(&result[..8]))
    }
}

/// Check a secret for the credential invariants.
///
/// Returns every violation found; an empty list means the secret is usable.
pub fn validate_secret(secret: &SecretData) -> Vec<String> {
    let mut violations = Vec::new();

    let token_empty = secret.get_trimmed(TOKEN_KEY).is_empty();
    let hmac_empty = secret.get_trimmed(HMAC_KEY).is_empty();
    if token_empty == hmac_empty {
        violations.push(format!(
            "either {HMAC_KEY} or {TOKEN_KEY} is required field"
        ));
    }
    if secret.get_trimmed(URL_KEY).is_empty() {
        violations.push(format!("secret {URL_KEY} is required field"));
    }

    violations
}

/// Redact a secret for logging/display.
///
/// Returns a map with all values replaced by `[REDACTED]`.
pub fn redact_for_display(secret: &SecretData) -> BTreeMap<String, String> {
    secret
        .keys()
        .map(|k| (k.to_string(), "[REDACTED]".to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(pairs: &[(&str, &str)]) -> SecretData {
        pairs.iter().map(|(k, v)| (*k, v.as_bytes().to_vec())).collect()
    }

    #[test]
    fn test_token_credentials() {
        let s = secret(&[(URL_KEY, " https://metal.example.com \n"), (TOKEN_KEY, "tok")]);
        let creds = Credentials::from_secret(&s).unwrap();
        assert_eq!(creds.endpoint(), "https://metal.example.com");
        assert_eq!(creds.auth(), &ApiAuth::Token("tok".to_string()));
    }

    #[test]
    fn test_hmac_credentials() {
        let s = secret(&[(URL_KEY, "https://metal.example.com"), (HMAC_KEY, "shared")]);
        let creds = Credentials::from_secret(&s).unwrap();
        assert_eq!(creds.auth().scheme(), "hmac");
    }

    #[test]
    fn test_both_auth_fields_rejected() {
        let s = secret(&[
            (URL_KEY, "https://metal.example.com"),
            (TOKEN_KEY, "tok"),
            (HMAC_KEY, "shared"),
        ]);
        let err = Credentials::from_secret(&s).unwrap_err();
        assert_eq!(err.violations().len(), 1);
    }

    #[test]
    fn test_whitespace_only_counts_as_absent() {
        let s = secret(&[(URL_KEY, "https://metal.example.com"), (TOKEN_KEY, "   ")]);
        assert!(Credentials::from_secret(&s).is_err());
    }

    #[test]
    fn test_all_violations_reported() {
        let err = Credentials::from_secret(&SecretData::new()).unwrap_err();
        let violations = err.violations();
        assert_eq!(violations.len(), 2);
        assert!(violations[0].contains(HMAC_KEY));
        assert!(violations[1].contains(URL_KEY));
    }

    #[test]
    fn test_debug_never_prints_secret_values() {
        let s = secret(&[(URL_KEY, "https://metal.example.com"), (TOKEN_KEY, "very-secret")]);
        let creds = Credentials::from_secret(&s).unwrap();

        assert!(!format!("{s:?}").contains("very-secret"));
        assert!(!format!("{creds:?}").contains("very-secret"));
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = Credentials::new("https://a", ApiAuth::Token("t".to_string()));
        let b = Credentials::new("https://a", ApiAuth::Token("t".to_string()));
        let c = Credentials::new("https://a", ApiAuth::Hmac("t".to_string()));

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert!(a.fingerprint().starts_with("sha256:"));
    }

    #[test]
    fn test_user_data_trimmed() {
        let s = secret(&[(USER_DATA_KEY, "\n#cloud-config\nruncmd: []\n\n")]);
        assert_eq!(s.user_data(), "#cloud-config\nruncmd: []");
        assert_eq!(SecretData::new().user_data(), "");
    }
}

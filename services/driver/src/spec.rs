//! Provider spec decoding and validation.
//!
//! The orchestrator stores the provider spec as an opaque JSON blob on the
//! machine class. Two shapes are recognised:
//!
//! - the current flat spec (`{"partition": ..., "size": ..., ...}`)
//! - the legacy `MetalMachineClass` object (`{"kind": "MetalMachineClass",
//!   "spec": {...}}`), upgraded in place
//!
//! Decoding collects every validation problem of the provider spec and the secret
//! into a single error, so the orchestrator sees the whole list at once.

use metal_credentials::{Credentials, SecretData};
use metal_provider_id::SEPARATOR;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Kind marker of the legacy machine class shape.
pub const LEGACY_MACHINE_CLASS_KIND: &str = "MetalMachineClass";

/// DNS server override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsServer {
    pub ip: String,
}

/// NTP server override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtpServer {
    pub address: String,
}

/// The current provider spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningSpec {
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub dns_servers: Vec<DnsServer>,
    #[serde(default)]
    pub ntp_servers: Vec<NtpServer>,
}

impl ProvisioningSpec {
    /// Check required fields, returning every violation.
    ///
    /// The partition is embedded in provider ids, so it may not contain the
    /// id separator.
    pub fn validate(&self) -> Vec<String> {
        let required = [
            ("image", &self.image),
            ("network", &self.network),
            ("partition", &self.partition),
            ("project", &self.project),
            ("size", &self.size),
        ];

        let mut violations: Vec<String> = required
            .iter()
            .filter(|(_, value)| value.is_empty())
            .map(|(field, _)| format!("{field} is required field"))
            .collect();

        if self.partition.contains(SEPARATOR) {
            violations.push(format!("partition must not contain '{SEPARATOR}'"));
        }

        violations
    }
}

/// Spec body of the legacy machine class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMachineClassSpec {
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyMachineClass {
    spec: LegacyMachineClassSpec,
}

/// Every provider spec shape the driver accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionedSpec {
    Current(ProvisioningSpec),
    LegacyMachineClass(LegacyMachineClassSpec),
}

impl VersionedSpec {
    /// Parse a raw provider spec blob.
    pub fn from_slice(raw: &[u8]) -> Result<Self, DriverError> {
        let value: serde_json::Value =
            serde_json::from_slice(raw).map_err(|e| DriverError::Decode(e.to_string()))?;

        let is_legacy = value
            .get("kind")
            .and_then(|k| k.as_str())
            .is_some_and(|k| k == LEGACY_MACHINE_CLASS_KIND);

        if is_legacy {
            let class: LegacyMachineClass =
                serde_json::from_value(value).map_err(|e| DriverError::Decode(e.to_string()))?;
            Ok(Self::LegacyMachineClass(class.spec))
        } else {
            let spec: ProvisioningSpec =
                serde_json::from_value(value).map_err(|e| DriverError::Decode(e.to_string()))?;
            Ok(Self::Current(spec))
        }
    }

    /// Convert to the current spec.
    pub fn upgrade(self) -> ProvisioningSpec {
        match self {
            Self::Current(spec) => spec,
            Self::LegacyMachineClass(legacy) => ProvisioningSpec {
                partition: legacy.partition,
                size: legacy.size,
                image: legacy.image,
                project: legacy.project,
                network: legacy.network,
                tags: legacy.tags,
                ssh_keys: legacy.ssh_keys,
                dns_servers: Vec::new(),
                ntp_servers: Vec::new(),
            },
        }
    }
}

/// A validated request: spec, credentials and user data.
#[derive(Debug, Clone)]
pub struct DecodedRequest {
    pub spec: ProvisioningSpec,
    pub credentials: Credentials,
    pub user_data: String,
}

/// Decode and validate a provider spec blob and its secret.
pub fn decode(raw: &[u8], secret: &SecretData) -> Result<DecodedRequest, DriverError> {
    let spec = VersionedSpec::from_slice(raw)?.upgrade();

    let mut violations = spec.validate();
    violations.extend(metal_credentials::validate_secret(secret));
    if !violations.is_empty() {
        return Err(DriverError::Validation(violations));
    }

    let credentials = Credentials::from_secret(secret)
        .map_err(|e| DriverError::Validation(e.violations().to_vec()))?;

    Ok(DecodedRequest {
        spec,
        credentials,
        user_data: secret.user_data(),
    })
}

#[cfg(test)]
mod tests {
    use metal_credentials::{ApiAuth, HMAC_KEY, TOKEN_KEY, URL_KEY, USER_DATA_KEY};

    use super::*;

    fn secret() -> SecretData {
        [
            (URL_KEY, "https://metal.example.com"),
            (TOKEN_KEY, "tok"),
            (USER_DATA_KEY, "  #cloud-config\n"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.as_bytes().to_vec()))
        .collect()
    }

    const FULL_SPEC: &str = r#"{
        "partition": "fra-equ01",
        "size": "c1-xlarge-x86",
        "image": "ubuntu-24.04",
        "project": "proj-1",
        "network": "net-1",
        "tags": ["cluster.metal-stack.io/id=c1", "kubernetes.io/role=node"],
        "sshKeys": ["ssh-ed25519 AAAA"],
        "dnsServers": [{"ip": "1.1.1.1"}],
        "ntpServers": [{"address": "pool.ntp.org"}]
    }"#;

    #[test]
    fn test_decode_full_spec() {
        let decoded = decode(FULL_SPEC.as_bytes(), &secret()).unwrap();

        assert_eq!(decoded.spec.partition, "fra-equ01");
        assert_eq!(decoded.spec.ssh_keys, vec!["ssh-ed25519 AAAA".to_string()]);
        assert_eq!(decoded.spec.dns_servers[0].ip, "1.1.1.1");
        assert_eq!(decoded.spec.ntp_servers[0].address, "pool.ntp.org");
        assert_eq!(decoded.credentials.auth(), &ApiAuth::Token("tok".to_string()));
        assert_eq!(decoded.user_data, "#cloud-config");
    }

    #[test]
    fn test_malformed_blob_is_decode_error() {
        let err = decode(b"{not json", &secret()).unwrap_err();
        assert!(matches!(err, DriverError::Decode(_)));

        let err = decode(br#"{"tags": "not-a-list"}"#, &secret()).unwrap_err();
        assert!(matches!(err, DriverError::Decode(_)));
    }

    #[test]
    fn test_two_missing_fields_reported_together() {
        let raw = r#"{"partition": "fra-equ01", "project": "p", "network": "n"}"#;
        let err = decode(raw.as_bytes(), &secret()).unwrap_err();

        let DriverError::Validation(violations) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert_eq!(
            violations,
            vec![
                "image is required field".to_string(),
                "size is required field".to_string(),
            ]
        );
    }

    #[test]
    fn test_spec_and_secret_violations_combined() {
        let mut bad_secret = secret();
        bad_secret.insert(HMAC_KEY, "shared");

        let raw = r#"{"partition": "fra-equ01", "size": "s", "image": "i", "project": "p"}"#;
        let DriverError::Validation(violations) = decode(raw.as_bytes(), &bad_secret).unwrap_err()
        else {
            panic!("expected validation error");
        };

        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0], "network is required field");
        assert!(violations[1].contains(HMAC_KEY));
    }

    #[test]
    fn test_partition_with_separator_rejected() {
        let raw = r#"{"partition": "fra/equ01", "project": "p", "network": "n", "image": "i"}"#;
        let DriverError::Validation(violations) = decode(raw.as_bytes(), &secret()).unwrap_err()
        else {
            panic!("expected validation error");
        };

        assert_eq!(
            violations,
            vec![
                "size is required field".to_string(),
                "partition must not contain '/'".to_string(),
            ]
        );
    }

    #[test]
    fn test_legacy_machine_class_upgraded() {
        let raw = r#"{
            "kind": "MetalMachineClass",
            "spec": {
                "partition": "fra-equ01",
                "size": "s",
                "image": "i",
                "project": "p",
                "network": "n",
                "tags": ["cluster.metal-stack.io/id=c1"],
                "sshKeys": ["k"]
            }
        }"#;

        let versioned = VersionedSpec::from_slice(raw.as_bytes()).unwrap();
        assert!(matches!(versioned, VersionedSpec::LegacyMachineClass(_)));

        let spec = versioned.upgrade();
        assert_eq!(spec.partition, "fra-equ01");
        assert_eq!(spec.ssh_keys, vec!["k".to_string()]);
        assert!(spec.dns_servers.is_empty());
        assert!(spec.validate().is_empty());
    }
}

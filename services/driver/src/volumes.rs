//! Volume id extraction for the orchestrator's detach safety net.

use serde::{Deserialize, Serialize};
use tracing::error;

/// CSI driver of the network block storage used by metal clusters.
pub const DEFAULT_BLOCK_STORAGE_DRIVER: &str = "csi.lightbitslabs.com";

const HANDLE_FIELD_SEPARATOR: char = '|';
const HANDLE_KEY_SEPARATOR: char = ':';
const NGUID_KEY: &str = "nguid";

/// CSI source of a persistent volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsiVolumeSource {
    pub driver: String,
    pub volume_handle: String,
}

/// The part of a persistent volume spec the driver reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeSpec {
    #[serde(default)]
    pub csi: Option<CsiVolumeSource>,
}

impl PersistentVolumeSpec {
    /// A volume backed by the given CSI driver and handle.
    pub fn csi(driver: impl Into<String>, volume_handle: impl Into<String>) -> Self {
        Self {
            csi: Some(CsiVolumeSource {
                driver: driver.into(),
                volume_handle: volume_handle.into(),
            }),
        }
    }
}

/// Persistent volumes whose ids are requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetVolumeIdsRequest {
    pub pv_specs: Vec<PersistentVolumeSpec>,
}

/// Extracted volume ids, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetVolumeIdsResponse {
    pub volume_ids: Vec<String>,
}

/// Extract volume ids, in input order.
///
/// Handles of `block_storage_driver` look like `mgmt:H|nguid:ABC|proj:P`;
/// the `nguid` value is returned, or the whole handle if it has none.
/// Other CSI drivers yield their raw handle. Non-CSI volumes are skipped.
pub fn volume_ids(specs: &[PersistentVolumeSpec], block_storage_driver: &str) -> Vec<String> {
    specs
        .iter()
        .filter_map(|spec| spec.csi.as_ref())
        .map(|csi| {
            if csi.driver != block_storage_driver {
                return csi.volume_handle.clone();
            }
            match handle_field(&csi.volume_handle, NGUID_KEY) {
                Some(nguid) => nguid.to_string(),
                None => {
                    error!(
                        handle = %csi.volume_handle,
                        driver = %csi.driver,
                        "Volume handle has no nguid, using raw handle"
                    );
                    csi.volume_handle.clone()
                }
            }
        })
        .collect()
}

fn handle_field<'a>(handle: &'a str, key: &str) -> Option<&'a str> {
    handle
        .split(HANDLE_FIELD_SEPARATOR)
        .filter_map(|field| field.split_once(HANDLE_KEY_SEPARATOR))
        .find_map(|(k, v)| (k == key).then_some(v))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::nguid_present(DEFAULT_BLOCK_STORAGE_DRIVER, "mgmt:H|nguid:ABC|proj:P", "ABC")]
    #[case::nguid_first(DEFAULT_BLOCK_STORAGE_DRIVER, "nguid:ABC", "ABC")]
    #[case::nguid_absent(DEFAULT_BLOCK_STORAGE_DRIVER, "mgmt:H|proj:P", "mgmt:H|proj:P")]
    #[case::foreign_driver("csi.example.com", "mgmt:H|nguid:ABC|proj:P", "mgmt:H|nguid:ABC|proj:P")]
    #[case::foreign_driver_plain("csi.example.com", "vol-123", "vol-123")]
    fn test_volume_id_extraction(#[case] driver: &str, #[case] handle: &str, #[case] expected: &str) {
        let ids = volume_ids(
            &[PersistentVolumeSpec::csi(driver, handle)],
            DEFAULT_BLOCK_STORAGE_DRIVER,
        );
        assert_eq!(ids, vec![expected.to_string()]);
    }

    #[test]
    fn test_order_preserved_and_non_csi_skipped() {
        let specs = vec![
            PersistentVolumeSpec::csi(DEFAULT_BLOCK_STORAGE_DRIVER, "nguid:B"),
            PersistentVolumeSpec::default(),
            PersistentVolumeSpec::csi("csi.example.com", "raw-a"),
        ];
        assert_eq!(
            volume_ids(&specs, DEFAULT_BLOCK_STORAGE_DRIVER),
            vec!["B".to_string(), "raw-a".to_string()]
        );
    }

    #[test]
    fn test_deserialize_pv_spec() {
        let spec: PersistentVolumeSpec = serde_json::from_str(
            r#"{"csi": {"driver": "csi.lightbitslabs.com", "volumeHandle": "nguid:X"}}"#,
        )
        .unwrap();
        assert_eq!(volume_ids(&[spec], DEFAULT_BLOCK_STORAGE_DRIVER), vec!["X".to_string()]);
    }
}

//! Cluster ownership tags.
//!
//! A machine belongs to a cluster when it carries `cluster.metal-stack.io/id=<id>`
//! with exactly the cluster's id. Tags are `key=value` strings; the value is
//! everything after the first `=`. When a key repeats, the last tag wins.

use crate::spec::ProvisioningSpec;

/// Tag key marking cluster ownership.
pub const CLUSTER_ID_TAG: &str = "cluster.metal-stack.io/id";

/// Value of the last tag whose key is exactly `key`.
pub fn tag_value<'a>(tags: &'a [String], key: &str) -> Option<&'a str> {
    tags.iter().rev().find_map(|tag| match tag.split_once('=') {
        Some((k, v)) if k == key => Some(v),
        _ => None,
    })
}

/// The owning cluster of a machine, as declared by a provider spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTag {
    value: String,
}

impl ClusterTag {
    /// Extract the cluster tag from a spec. An empty value counts as absent.
    pub fn from_spec(spec: &ProvisioningSpec) -> Option<Self> {
        Self::from_tags(&spec.tags)
    }

    /// Extract the cluster tag from a tag list. An empty value counts as absent.
    pub fn from_tags(tags: &[String]) -> Option<Self> {
        tag_value(tags, CLUSTER_ID_TAG)
            .filter(|v| !v.is_empty())
            .map(|v| Self {
                value: v.to_string(),
            })
    }

    /// The cluster id.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Full `key=value` form, as sent to the API.
    pub fn as_tag(&self) -> String {
        format!("{CLUSTER_ID_TAG}={}", self.value)
    }

    /// Returns true if `tags` mark the same cluster.
    pub fn matches(&self, tags: &[String]) -> bool {
        tag_value(tags, CLUSTER_ID_TAG) == Some(self.value.as_str())
    }
}

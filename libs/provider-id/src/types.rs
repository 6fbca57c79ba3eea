//! Provider id type and the free-standing encode/decode helpers.
//!
//! Encoding is infallible and never validates, because the orchestrator
//! expects an id back for every successful allocation. Decoding is lenient:
//! anything that is not a well-formed provider id decodes to an empty
//! instance id, which callers treat as "never created".

use crate::IdError;

/// Scheme prefix of every provider id.
pub const SCHEME: &str = "metal://";

/// Separator between scheme, partition and instance id.
pub const SEPARATOR: char = '/';

/// A parsed provider id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderId {
    partition: String,
    instance_id: String,
}

impl ProviderId {
    /// Creates a provider id after checking both components.
    pub fn new(
        partition: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Result<Self, IdError> {
        let partition = partition.into();
        let instance_id = instance_id.into();

        if partition.is_empty() {
            return Err(IdError::EmptyPartition);
        }
        if partition.contains(SEPARATOR) {
            return Err(IdError::ReservedSeparator(partition));
        }
        if instance_id.is_empty() {
            return Err(IdError::EmptyInstanceId);
        }

        Ok(Self {
            partition,
            instance_id,
        })
    }

    /// Parses a provider id from a string.
    ///
    /// The string must be in the format `metal:///{partition}/{instance_id}`.
    /// The partition ends at the first separator after the scheme, so the
    /// instance id keeps any separators it contains.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some(rest) = s.strip_prefix(SCHEME) else {
            return Err(IdError::MissingScheme {
                expected: SCHEME,
                actual: s.to_string(),
            });
        };

        let Some(rest) = rest.strip_prefix(SEPARATOR) else {
            return Err(IdError::InvalidFormat {
                message: "expected empty authority after scheme".to_string(),
            });
        };

        let Some((partition, instance_id)) = rest.split_once(SEPARATOR) else {
            return Err(IdError::InvalidFormat {
                message: "missing separator between partition and instance id".to_string(),
            });
        };

        Self::new(partition, instance_id)
    }

    /// Returns the partition component.
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Returns the instance id component.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Consumes the id, returning the instance id component.
    pub fn into_instance_id(self) -> String {
        self.instance_id
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{SCHEME}{SEPARATOR}{}{SEPARATOR}{}", self.partition, self.instance_id)
    }
}

impl std::str::FromStr for ProviderId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ProviderId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ProviderId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Encodes a partition and instance id into a provider id string.
#[must_use]
pub fn encode_machine_id(partition: &str, instance_id: &str) -> String {
    format!("{SCHEME}{SEPARATOR}{partition}{SEPARATOR}{instance_id}")
}

/// Decodes the instance id from a provider id string.
///
/// Returns an empty string for empty, foreign-scheme or malformed input.
#[must_use]
pub fn decode_machine_id(provider_id: &str) -> String {
    ProviderId::parse(provider_id)
        .map(ProviderId::into_instance_id)
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================

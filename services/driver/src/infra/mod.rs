//! Infrastructure API interface.
//!
//! The driver talks to the bare-metal API only through [`MachineApi`]. The
//! real client is supplied by the embedding process through a
//! [`SessionProvider`], which builds one client per call from the
//! credentials in the orchestrator's secret.
//!
//! A scripted in-memory implementation lives in [`fake`].

pub mod fake;

use std::sync::Arc;

use async_trait::async_trait;
use metal_credentials::Credentials;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fake::{FakeMachineApi, FakeOp};

/// Errors reported by the infrastructure client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The client could not be built from the credentials.
    #[error("failed to initialize api client: {0}")]
    Session(String),

    /// The request never got a response (connection, TLS, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// The referenced machine does not exist.
    #[error("machine {0} not found")]
    NotFound(String),

    /// The API answered with an error status.
    #[error("api returned status {status}: {message}")]
    Status { status: u16, message: String },
}

impl ApiError {
    /// Returns true if the API reported that the machine does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

/// Network attached to an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationNetwork {
    pub network_id: String,
    pub auto_acquire: bool,
}

/// Request to allocate a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub name: String,
    pub hostname: String,
    pub description: String,
    pub user_data: String,
    pub size: String,
    pub project: String,
    pub partition: String,
    pub image: String,
    pub networks: Vec<AllocationNetwork>,
    pub tags: Vec<String>,
    pub ssh_pub_keys: Vec<String>,
    pub placement_tags: Vec<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub ntp_servers: Vec<String>,
}

/// Filter for machine searches. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub allocation_project: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Role of an allocated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationRole {
    Machine,
    Firewall,
}

/// Partition reference on a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRef {
    #[serde(default)]
    pub id: Option<String>,
}

/// Allocation record of a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub role: Option<AllocationRole>,
}

/// A machine as reported by the API.
///
/// Every field is optional on the wire; the driver checks what it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub partition: Option<PartitionRef>,
    #[serde(default)]
    pub allocation: Option<Allocation>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Machine {
    /// Partition id, if reported and non-empty.
    pub fn partition_id(&self) -> Option<&str> {
        self.partition
            .as_ref()
            .and_then(|p| p.id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Bare-metal machine API.
#[async_trait]
pub trait MachineApi: Send + Sync {
    /// Allocate a machine.
    async fn allocate(&self, request: AllocateRequest) -> Result<Machine, ApiError>;

    /// Find machines matching a filter.
    async fn find(&self, request: FindRequest) -> Result<Vec<Machine>, ApiError>;

    /// Free (release) a machine.
    async fn free(&self, id: &str) -> Result<Machine, ApiError>;

    /// Get a machine by id.
    async fn get(&self, id: &str) -> Result<Machine, ApiError>;
}

/// Builds API clients from per-call credentials.
pub trait SessionProvider: Send + Sync {
    /// Create a client for the given credentials.
    fn session(&self, credentials: &Credentials) -> Result<Arc<dyn MachineApi>, ApiError>;
}

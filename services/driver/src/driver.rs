//! Lifecycle driver.
//!
//! Implements the orchestrator-facing machine operations on top of the
//! infrastructure API. The driver keeps no machine state of its own: every
//! call opens a client from the request's credentials, observes the API and
//! derives the machine's phase from what it sees.
//!
//! Ownership is always checked twice: the API filter narrows by cluster tag,
//! and the driver re-checks the exact tag value on every returned record.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metal_credentials::SecretData;
use metal_provider_id::{decode_machine_id, encode_machine_id, SEPARATOR};
use metal_reconcile::{CreationGuard, MachinePhase, Observation, PhaseEvent};
use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::context::RequestContext;
use crate::error::DriverError;
use crate::infra::{
    AllocateRequest, AllocationNetwork, AllocationRole, FindRequest, Machine, MachineApi,
    SessionProvider,
};
use crate::spec::{decode, DecodedRequest};
use crate::tags::{tag_value, ClusterTag, CLUSTER_ID_TAG};
use crate::volumes::{volume_ids, GetVolumeIdsRequest, GetVolumeIdsResponse};

/// Request to allocate a machine.
#[derive(Debug, Clone, Default)]
pub struct CreateMachineRequest {
    pub machine_name: String,
    pub provider_spec: Vec<u8>,
    pub secret: SecretData,
}

/// Provider id and node name of a new machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMachineResponse {
    pub provider_id: String,
    pub node_name: String,
}

/// Request to release a machine.
#[derive(Debug, Clone, Default)]
pub struct DeleteMachineRequest {
    pub machine_name: String,
    pub provider_id: String,
    pub provider_spec: Vec<u8>,
    pub secret: SecretData,
}

/// Request for the status of a machine.
#[derive(Debug, Clone, Default)]
pub struct GetMachineStatusRequest {
    pub machine_name: String,
    pub provider_id: String,
    pub provider_spec: Vec<u8>,
    pub secret: SecretData,
}

/// Provider id and node name of an allocated machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMachineStatusResponse {
    pub provider_id: String,
    pub node_name: String,
}

/// Request to list the machines of a machine class.
#[derive(Debug, Clone, Default)]
pub struct ListMachinesRequest {
    pub machine_class_name: String,
    pub provider_spec: Vec<u8>,
    pub secret: SecretData,
}

/// Machines owned by the cluster: provider id -> hostname.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMachinesResponse {
    pub machine_list: BTreeMap<String, String>,
}

/// Orchestrator-facing machine operations.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Allocate a machine for `request.machine_name`.
    async fn create_machine(
        &self,
        ctx: &RequestContext,
        request: CreateMachineRequest,
    ) -> Result<CreateMachineResponse, DriverError>;

    /// Release a machine. Succeeds if it is already gone.
    async fn delete_machine(
        &self,
        ctx: &RequestContext,
        request: DeleteMachineRequest,
    ) -> Result<(), DriverError>;

    /// Report a machine, or `NotFound` if it is not allocated to this cluster.
    async fn get_machine_status(
        &self,
        ctx: &RequestContext,
        request: GetMachineStatusRequest,
    ) -> Result<GetMachineStatusResponse, DriverError>;

    /// List all machines owned by the cluster of the provider spec.
    async fn list_machines(
        &self,
        ctx: &RequestContext,
        request: ListMachinesRequest,
    ) -> Result<ListMachinesResponse, DriverError>;

    /// Extract block storage volume ids from persistent volume specs.
    async fn get_volume_ids(
        &self,
        ctx: &RequestContext,
        request: GetVolumeIdsRequest,
    ) -> Result<GetVolumeIdsResponse, DriverError>;

    /// Legacy machine class migration. Not supported.
    async fn generate_machine_class_for_migration(
        &self,
        _ctx: &RequestContext,
    ) -> Result<(), DriverError> {
        Err(DriverError::Unimplemented(
            "machine class migration is not supported",
        ))
    }

    /// Provider-specific VM initialization. Not supported.
    async fn initialize_machine(&self, _ctx: &RequestContext) -> Result<(), DriverError> {
        Err(DriverError::Unimplemented(
            "machine initialization is not supported",
        ))
    }
}

/// Driver backed by a metal infrastructure API.
pub struct MachineDriver {
    sessions: Arc<dyn SessionProvider>,
    guard: Arc<CreationGuard>,
    config: DriverConfig,
}

impl MachineDriver {
    /// Build a driver around an existing guard.
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        guard: Arc<CreationGuard>,
        config: DriverConfig,
    ) -> Self {
        Self {
            sessions,
            guard,
            config,
        }
    }

    /// Build a driver with a fresh guard sized from the configuration.
    pub fn from_config(sessions: Arc<dyn SessionProvider>, config: DriverConfig) -> Self {
        let guard = Arc::new(CreationGuard::new(config.create_backoff));
        Self::new(sessions, guard, config)
    }

    /// The creation guard shared by all create calls.
    pub fn guard(&self) -> &Arc<CreationGuard> {
        &self.guard
    }

    /// The driver configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Apply the configured call timeout to a caller context.
    fn context(&self, ctx: &RequestContext) -> RequestContext {
        match self.config.call_timeout {
            Some(timeout) => ctx.clone().with_timeout(timeout),
            None => ctx.clone(),
        }
    }

    fn session(&self, decoded: &DecodedRequest) -> Result<Arc<dyn MachineApi>, DriverError> {
        debug!(
            endpoint = %decoded.credentials.endpoint(),
            credentials = %decoded.credentials.fingerprint(),
            auth = decoded.credentials.auth().scheme(),
            "Opening infrastructure session"
        );
        self.sessions.session(&decoded.credentials).map_err(|e| {
            error!(error = %e, "Failed to open infrastructure session");
            DriverError::from(e)
        })
    }
}

fn cluster_tag(decoded: &DecodedRequest, operation: &'static str) -> Result<ClusterTag, DriverError> {
    ClusterTag::from_spec(&decoded.spec).ok_or_else(|| {
        warn!(operation, "Provider spec has no {} tag", CLUSTER_ID_TAG);
        DriverError::MissingClusterTag { operation }
    })
}

fn build_allocate_request(
    machine_name: &str,
    decoded: &DecodedRequest,
    tag: &ClusterTag,
) -> AllocateRequest {
    let spec = &decoded.spec;
    AllocateRequest {
        name: machine_name.to_string(),
        hostname: machine_name.to_string(),
        description: format!("{machine_name} created by Gardener."),
        user_data: decoded.user_data.clone(),
        size: spec.size.clone(),
        project: spec.project.clone(),
        partition: spec.partition.clone(),
        image: spec.image.clone(),
        networks: vec![AllocationNetwork {
            network_id: spec.network.clone(),
            auto_acquire: true,
        }],
        tags: spec.tags.clone(),
        ssh_pub_keys: spec.ssh_keys.clone(),
        placement_tags: vec![tag.as_tag()],
        dns_servers: spec.dns_servers.iter().map(|s| s.ip.clone()).collect(),
        ntp_servers: spec.ntp_servers.iter().map(|s| s.address.clone()).collect(),
    }
}

/// Id and partition of a machine record, both required to be non-empty.
///
/// A partition containing the id separator could not be decoded again.
fn identity(machine: &Machine) -> Result<(&str, &str), DriverError> {
    let id = machine
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| DriverError::InvalidResponse("machine has no id".to_string()))?;
    let partition = machine.partition_id().ok_or_else(|| {
        DriverError::InvalidResponse(format!("machine {id} has no partition id"))
    })?;
    if partition.contains(SEPARATOR) {
        return Err(DriverError::InvalidResponse(format!(
            "machine {id} has partition id {partition} containing '{SEPARATOR}'"
        )));
    }
    Ok((id, partition))
}

/// Provider id and hostname of a listed record, `None` for non-machine roles.
fn list_entry(machine: &Machine) -> Result<Option<(String, String)>, DriverError> {
    let (id, partition) = identity(machine)?;
    let allocation = machine
        .allocation
        .as_ref()
        .ok_or_else(|| DriverError::InvalidResponse(format!("machine {id} has no allocation")))?;

    match allocation.role {
        Some(AllocationRole::Machine) => {}
        Some(role) => {
            debug!(instance_id = id, ?role, "Skipping non-machine allocation");
            return Ok(None);
        }
        None => {
            return Err(DriverError::InvalidResponse(format!(
                "machine {id} has no allocation role"
            )));
        }
    }

    let hostname = allocation
        .hostname
        .clone()
        .ok_or_else(|| DriverError::InvalidResponse(format!("machine {id} has no hostname")))?;
    Ok(Some((encode_machine_id(partition, id), hostname)))
}

#[async_trait]
impl Driver for MachineDriver {
    async fn create_machine(
        &self,
        ctx: &RequestContext,
        request: CreateMachineRequest,
    ) -> Result<CreateMachineResponse, DriverError> {
        let ctx = self.context(ctx);
        let machine = request.machine_name.as_str();
        info!(request_id = %ctx.request_id(), machine, "Create machine requested");

        let decoded = decode(&request.provider_spec, &request.secret).inspect_err(|e| {
            warn!(machine, error = %e, "Rejecting create request");
        })?;
        let tag = cluster_tag(&decoded, "create")?;

        let now = Instant::now();
        if let Some(retry_after) = self.guard.remaining(machine, now) {
            info!(
                machine,
                retry_after_ms = retry_after.as_millis() as u64,
                "Backing off from machine creation"
            );
            return Err(DriverError::Throttled {
                machine: machine.to_string(),
                retry_after,
            });
        }

        let api = self.session(&decoded)?;
        let allocate = build_allocate_request(machine, &decoded, &tag);

        let phase = MachinePhase::Absent.transition(PhaseEvent::AllocationRequested)?;
        self.guard.record_attempt(machine, now);

        let allocated = match ctx.call(api.allocate(allocate)).await {
            Ok(allocated) => allocated,
            Err(err) => {
                // Cancelled or timed-out allocations may still complete on the
                // API side, so the guard keeps the attempt for those.
                if matches!(err, DriverError::Infrastructure(_)) {
                    self.guard.forget(machine);
                }
                phase.transition(PhaseEvent::AllocationFailed)?;
                error!(
                    machine,
                    project = %decoded.spec.project,
                    partition = %decoded.spec.partition,
                    error = %err,
                    "Machine allocation failed"
                );
                return Err(err);
            }
        };
        phase.transition(PhaseEvent::AllocationSucceeded)?;

        let instance_id = allocated
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DriverError::InvalidResponse("allocated machine has no id".to_string()))?;
        let node_name = allocated
            .allocation
            .as_ref()
            .and_then(|a| a.name.clone())
            .ok_or_else(|| {
                DriverError::InvalidResponse(format!("machine {instance_id} has no allocation name"))
            })?;

        let provider_id = encode_machine_id(&decoded.spec.partition, instance_id);
        info!(
            machine,
            instance_id,
            provider_id = %provider_id,
            project = %decoded.spec.project,
            "Machine allocated"
        );

        Ok(CreateMachineResponse {
            provider_id,
            node_name,
        })
    }

    async fn delete_machine(
        &self,
        ctx: &RequestContext,
        request: DeleteMachineRequest,
    ) -> Result<(), DriverError> {
        let ctx = self.context(ctx);
        let machine = request.machine_name.as_str();
        info!(
            request_id = %ctx.request_id(),
            machine,
            provider_id = %request.provider_id,
            "Delete machine requested"
        );

        let decoded = decode(&request.provider_spec, &request.secret).inspect_err(|e| {
            warn!(machine, error = %e, "Rejecting delete request");
        })?;
        let tag = cluster_tag(&decoded, "delete")?;
        let project = decoded.spec.project.clone();

        let instance_id = decode_machine_id(&request.provider_id);
        if instance_id.is_empty() {
            info!(machine, "No instance id recorded, nothing to delete");
            return Ok(());
        }

        let api = self.session(&decoded)?;
        let found = ctx
            .call(api.find(FindRequest {
                id: Some(instance_id.clone()),
                allocation_project: Some(project.clone()),
                tags: vec![tag.as_tag()],
            }))
            .await?;

        let owned: Vec<&Machine> = found
            .iter()
            .filter(|m| m.id.as_deref() == Some(instance_id.as_str()) && tag.matches(&m.tags))
            .collect();

        match owned.as_slice() {
            [] => {
                info!(
                    machine,
                    instance_id = %instance_id,
                    project = %project,
                    "Machine not found, already released"
                );
                Ok(())
            }
            [target] => {
                let phase = MachinePhase::observe(Observation {
                    exists: true,
                    allocated: target.allocation.is_some(),
                    owned: true,
                });
                if phase.is_absent() {
                    info!(machine, instance_id = %instance_id, "Machine has no allocation, skipping free");
                    return Ok(());
                }

                match ctx.call(api.free(&instance_id)).await {
                    Ok(_) => {}
                    Err(DriverError::Infrastructure(e)) if e.is_not_found() => {
                        debug!(instance_id = %instance_id, "Machine vanished before free");
                    }
                    Err(err) => {
                        error!(machine, instance_id = %instance_id, error = %err, "Failed to free machine");
                        return Err(err);
                    }
                }
                phase.transition(PhaseEvent::Released)?;
                info!(machine, instance_id = %instance_id, "Machine released");
                Ok(())
            }
            many => {
                error!(
                    machine,
                    instance_id = %instance_id,
                    count = many.len(),
                    "Multiple machines match, refusing to delete"
                );
                Err(DriverError::Ambiguous {
                    instance_id,
                    count: many.len(),
                })
            }
        }
    }

    async fn get_machine_status(
        &self,
        ctx: &RequestContext,
        request: GetMachineStatusRequest,
    ) -> Result<GetMachineStatusResponse, DriverError> {
        let ctx = self.context(ctx);
        let machine = request.machine_name.as_str();
        debug!(request_id = %ctx.request_id(), machine, "Machine status requested");

        let decoded = decode(&request.provider_spec, &request.secret).inspect_err(|e| {
            warn!(machine, error = %e, "Rejecting status request");
        })?;
        let tag = cluster_tag(&decoded, "get status")?;

        let instance_id = decode_machine_id(&request.provider_id);
        if instance_id.is_empty() {
            return Err(DriverError::NotFound(
                "machine not found, not yet created".to_string(),
            ));
        }

        let api = self.session(&decoded)?;
        let found = match ctx.call(api.get(&instance_id)).await {
            Ok(found) => found,
            Err(DriverError::Infrastructure(e)) if e.is_not_found() => {
                return Err(DriverError::NotFound(format!(
                    "machine {instance_id} not found"
                )));
            }
            Err(err) => return Err(err),
        };

        let owned = tag.matches(&found.tags);
        let phase = MachinePhase::observe(Observation {
            exists: true,
            allocated: found.allocation.is_some(),
            owned,
        });
        if !phase.is_allocated() {
            let reason = if found.allocation.is_none() {
                "machine already released"
            } else if tag_value(&found.tags, CLUSTER_ID_TAG).is_none() {
                "machine has no cluster tag anymore"
            } else {
                "machine does not belong to this cluster anymore"
            };
            debug!(machine, instance_id = %instance_id, reason, "Machine not allocated to cluster");
            return Err(DriverError::NotFound(reason.to_string()));
        }

        let (id, partition) = identity(&found)?;
        let node_name = found
            .allocation
            .as_ref()
            .and_then(|a| a.name.clone())
            .ok_or_else(|| {
                DriverError::InvalidResponse(format!("machine {id} has no allocation name"))
            })?;

        Ok(GetMachineStatusResponse {
            provider_id: encode_machine_id(partition, id),
            node_name,
        })
    }

    async fn list_machines(
        &self,
        ctx: &RequestContext,
        request: ListMachinesRequest,
    ) -> Result<ListMachinesResponse, DriverError> {
        let ctx = self.context(ctx);
        let class = request.machine_class_name.as_str();
        debug!(request_id = %ctx.request_id(), machine_class = class, "List machines requested");

        let decoded = decode(&request.provider_spec, &request.secret).inspect_err(|e| {
            warn!(machine_class = class, error = %e, "Rejecting list request");
        })?;
        let tag = cluster_tag(&decoded, "list machines")?;

        let api = self.session(&decoded)?;
        let found = ctx
            .call(api.find(FindRequest {
                id: None,
                allocation_project: Some(decoded.spec.project.clone()),
                tags: vec![tag.as_tag()],
            }))
            .await?;

        let mut machine_list = BTreeMap::new();
        for candidate in found.iter().filter(|m| tag.matches(&m.tags)) {
            if let Some((provider_id, hostname)) = list_entry(candidate)? {
                machine_list.insert(provider_id, hostname);
            }
        }

        info!(
            machine_class = class,
            project = %decoded.spec.project,
            count = machine_list.len(),
            "Listed machines"
        );

        Ok(ListMachinesResponse { machine_list })
    }

    async fn get_volume_ids(
        &self,
        _ctx: &RequestContext,
        request: GetVolumeIdsRequest,
    ) -> Result<GetVolumeIdsResponse, DriverError> {
        Ok(GetVolumeIdsResponse {
            volume_ids: volume_ids(&request.pv_specs, &self.config.block_storage_driver),
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::infra::fake::allocated_machine;
    use crate::infra::PartitionRef;
    use crate::spec::ProvisioningSpec;

    use super::*;

    #[rstest]
    #[case::no_id(|m: &mut Machine| m.id = None)]
    #[case::empty_id(|m: &mut Machine| m.id = Some(String::new()))]
    #[case::no_partition(|m: &mut Machine| m.partition = None)]
    #[case::no_partition_id(|m: &mut Machine| m.partition = Some(PartitionRef { id: None }))]
    #[case::empty_partition_id(|m: &mut Machine| m.partition = Some(PartitionRef { id: Some(String::new()) }))]
    #[case::partition_with_separator(|m: &mut Machine| m.partition = Some(PartitionRef { id: Some("fra/equ01".to_string()) }))]
    #[case::no_allocation(|m: &mut Machine| m.allocation = None)]
    #[case::no_role(|m: &mut Machine| {
        if let Some(a) = m.allocation.as_mut() {
            a.role = None;
        }
    })]
    #[case::no_hostname(|m: &mut Machine| {
        if let Some(a) = m.allocation.as_mut() {
            a.hostname = None;
        }
    })]
    fn test_list_entry_rejects_incomplete_record(#[case] corrupt: fn(&mut Machine)) {
        let mut machine = allocated_machine("m1", "fra-equ01", "worker-a", "proj", &[]);
        corrupt(&mut machine);

        let err = list_entry(&machine).unwrap_err();
        assert!(matches!(err, DriverError::InvalidResponse(_)), "{err}");
    }

    #[test]
    fn test_list_entry_skips_firewall() {
        let mut machine = allocated_machine("fw1", "fra-equ01", "fw", "proj", &[]);
        if let Some(a) = machine.allocation.as_mut() {
            a.role = Some(AllocationRole::Firewall);
        }
        assert_eq!(list_entry(&machine).unwrap(), None);

        let machine = allocated_machine("m1", "fra-equ01", "worker-a", "proj", &[]);
        assert_eq!(
            list_entry(&machine).unwrap(),
            Some(("metal:///fra-equ01/m1".to_string(), "worker-a".to_string()))
        );
    }

    #[test]
    fn test_allocate_request_shape() {
        let decoded = DecodedRequest {
            spec: ProvisioningSpec {
                partition: "fra-equ01".to_string(),
                size: "c1-xlarge-x86".to_string(),
                image: "ubuntu-24.04".to_string(),
                project: "proj-1".to_string(),
                network: "net-1".to_string(),
                tags: vec!["cluster.metal-stack.io/id=c1".to_string()],
                ssh_keys: vec!["ssh-ed25519 AAAA".to_string()],
                dns_servers: vec![crate::spec::DnsServer {
                    ip: "1.1.1.1".to_string(),
                }],
                ntp_servers: vec![],
            },
            credentials: metal_credentials::Credentials::new(
                "https://metal.example.com",
                metal_credentials::ApiAuth::Token("t".to_string()),
            ),
            user_data: "#cloud-config".to_string(),
        };
        let tag = ClusterTag::from_spec(&decoded.spec).unwrap();

        let req = build_allocate_request("worker-a", &decoded, &tag);

        assert_eq!(req.name, "worker-a");
        assert_eq!(req.hostname, "worker-a");
        assert_eq!(req.description, "worker-a created by Gardener.");
        assert_eq!(req.user_data, "#cloud-config");
        assert_eq!(
            req.networks,
            vec![AllocationNetwork {
                network_id: "net-1".to_string(),
                auto_acquire: true
            }]
        );
        assert_eq!(req.placement_tags, vec!["cluster.metal-stack.io/id=c1".to_string()]);
        assert_eq!(req.dns_servers, vec!["1.1.1.1".to_string()]);
        assert!(req.ntp_servers.is_empty());
    }

    #[test]
    fn test_identity_requires_id_and_partition() {
        let mut machine = allocated_machine("m1", "p", "w", "proj", &[]);
        assert_eq!(identity(&machine).unwrap(), ("m1", "p"));

        machine.partition = None;
        assert!(matches!(identity(&machine), Err(DriverError::InvalidResponse(_))));

        machine.id = Some(String::new());
        assert!(matches!(identity(&machine), Err(DriverError::InvalidResponse(_))));
    }
}

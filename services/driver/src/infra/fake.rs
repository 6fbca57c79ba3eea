//! In-memory machine API with scripted responses.
//!
//! Used by tests and local development in place of a live backend. Machines
//! are kept in insertion order and searched linearly, so duplicate ids can be
//! staged to exercise ambiguous-result handling.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use metal_credentials::Credentials;
use tracing::debug;

use super::{
    AllocateRequest, Allocation, AllocationRole, ApiError, FindRequest, Machine, MachineApi,
    PartitionRef, SessionProvider,
};

/// Operations the fake counts and can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FakeOp {
    Session,
    Allocate,
    Find,
    Free,
    Get,
}

#[derive(Debug, Default)]
struct FakeState {
    machines: Vec<Machine>,
    calls: BTreeMap<FakeOp, usize>,
    failures: BTreeMap<FakeOp, ApiError>,
    allocate_requests: Vec<AllocateRequest>,
    freed: Vec<String>,
    session_endpoints: Vec<String>,
    next_id: u64,
}

/// Scripted machine API.
///
/// Clones share state, so a test can keep one handle for assertions while
/// the driver holds another.
#[derive(Debug, Clone, Default)]
pub struct FakeMachineApi {
    state: Arc<Mutex<FakeState>>,
    delay: Option<Duration>,
}

impl FakeMachineApi {
    /// Create an empty fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every API response (not session creation) by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Stage a machine.
    pub fn insert(&self, machine: Machine) {
        self.state().machines.push(machine);
    }

    /// Make every subsequent call of `op` fail with `error`.
    pub fn fail(&self, op: FakeOp, error: ApiError) {
        self.state().failures.insert(op, error);
    }

    /// Number of calls made for `op`.
    pub fn calls(&self, op: FakeOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// All allocation requests received, in order.
    pub fn allocate_requests(&self) -> Vec<AllocateRequest> {
        self.state().allocate_requests.clone()
    }

    /// Ids passed to `free`, in order.
    pub fn freed(&self) -> Vec<String> {
        self.state().freed.clone()
    }

    /// Endpoints sessions were opened against, in order.
    pub fn session_endpoints(&self) -> Vec<String> {
        self.state().session_endpoints.clone()
    }

    /// Snapshot of all staged machines.
    pub fn machines(&self) -> Vec<Machine> {
        self.state().machines.clone()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call and return the scripted failure, if any.
    fn begin(&self, op: FakeOp) -> Result<(), ApiError> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn respond(&self, op: FakeOp) -> Result<(), ApiError> {
        self.begin(op)?;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// Build an allocated machine owned by whatever `tags` say.
pub fn allocated_machine(
    id: &str,
    partition: &str,
    hostname: &str,
    project: &str,
    tags: &[&str],
) -> Machine {
    Machine {
        id: Some(id.to_string()),
        partition: Some(PartitionRef {
            id: Some(partition.to_string()),
        }),
        allocation: Some(Allocation {
            name: Some(hostname.to_string()),
            hostname: Some(hostname.to_string()),
            project: Some(project.to_string()),
            role: Some(AllocationRole::Machine),
        }),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

fn matches_filter(machine: &Machine, filter: &FindRequest) -> bool {
    if let Some(id) = &filter.id {
        if machine.id.as_ref() != Some(id) {
            return false;
        }
    }

    if let Some(project) = &filter.allocation_project {
        let allocated_to = machine.allocation.as_ref().and_then(|a| a.project.as_ref());
        if allocated_to != Some(project) {
            return false;
        }
    }

    filter.tags.iter().all(|t| machine.tags.contains(t))
}

#[async_trait]
impl MachineApi for FakeMachineApi {
    async fn allocate(&self, request: AllocateRequest) -> Result<Machine, ApiError> {
        self.respond(FakeOp::Allocate).await?;

        let mut state = self.state();
        state.next_id += 1;
        let id = format!("00000000-0000-0000-0000-{:012x}", state.next_id);

        let machine = Machine {
            id: Some(id.clone()),
            partition: Some(PartitionRef {
                id: Some(request.partition.clone()),
            }),
            allocation: Some(Allocation {
                name: Some(request.name.clone()),
                hostname: Some(request.hostname.clone()),
                project: Some(request.project.clone()),
                role: Some(AllocationRole::Machine),
            }),
            tags: request.tags.clone(),
        };

        debug!(id = %id, name = %request.name, "[FAKE] Allocated machine");
        state.allocate_requests.push(request);
        state.machines.push(machine.clone());
        Ok(machine)
    }

    async fn find(&self, request: FindRequest) -> Result<Vec<Machine>, ApiError> {
        self.respond(FakeOp::Find).await?;

        let state = self.state();
        let found: Vec<Machine> = state
            .machines
            .iter()
            .filter(|m| matches_filter(m, &request))
            .cloned()
            .collect();
        Ok(found)
    }

    async fn free(&self, id: &str) -> Result<Machine, ApiError> {
        self.respond(FakeOp::Free).await?;

        let mut state = self.state();
        state.freed.push(id.to_string());

        let Some(machine) = state
            .machines
            .iter_mut()
            .find(|m| m.id.as_deref() == Some(id))
        else {
            return Err(ApiError::NotFound(id.to_string()));
        };

        machine.allocation = None;
        machine.tags.clear();
        debug!(id = %id, "[FAKE] Freed machine");
        Ok(machine.clone())
    }

    async fn get(&self, id: &str) -> Result<Machine, ApiError> {
        self.respond(FakeOp::Get).await?;

        let state = self.state();
        let machine = state
            .machines
            .iter()
            .find(|m| m.id.as_deref() == Some(id))
            .cloned();
        machine.ok_or_else(|| ApiError::NotFound(id.to_string()))
    }
}

impl SessionProvider for FakeMachineApi {
    fn session(&self, credentials: &Credentials) -> Result<Arc<dyn MachineApi>, ApiError> {
        self.begin(FakeOp::Session)?;
        self.state()
            .session_endpoints
            .push(credentials.endpoint().to_string());
        Ok(Arc::new(self.clone()))
    }
}

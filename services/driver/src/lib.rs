//! Machine lifecycle driver for metal-stack bare-metal infrastructure.
//!
//! A cluster orchestrator asks the driver to create, delete, inspect and
//! list machines. The driver translates each request into calls against the
//! infrastructure API:
//!
//! - [`spec`] decodes and validates the provider spec and credential secret
//! - [`tags`] derives and checks cluster ownership tags
//! - [`driver`] runs the lifecycle operations
//! - [`volumes`] extracts block storage volume ids
//!
//! The infrastructure client itself is supplied through
//! [`infra::SessionProvider`]; [`infra::FakeMachineApi`] stands in for it in
//! tests.

pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod infra;
pub mod spec;
pub mod tags;
pub mod telemetry;
pub mod volumes;

pub use config::DriverConfig;
pub use context::RequestContext;
pub use driver::{
    CreateMachineRequest, CreateMachineResponse, DeleteMachineRequest, Driver,
    GetMachineStatusRequest, GetMachineStatusResponse, ListMachinesRequest, ListMachinesResponse,
    MachineDriver,
};
pub use error::DriverError;
pub use volumes::{GetVolumeIdsRequest, GetVolumeIdsResponse, PersistentVolumeSpec};

//! Virtual machine lifecycle management against a remote virtualization
//! endpoint: provisioning (bare or cloned), device reconciliation,
//! guest customization, migration, and cleanup of half-created VMs.

pub mod config;
pub mod config_spec;
pub mod customization;
pub mod device;
pub mod directory;
pub mod migrate;
mod net;
mod power;
mod rollback;
pub mod types;
pub mod vim;
mod workflow;

#[cfg(test)]
mod testing;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use vim_api::{
    Event, EventKind, Fault, GuestOsFamily, ManagedObjectRef, ObjectKind, TaskRequest,
    VirtualDevice, VmProperties,
};

pub use config::LifecycleConfig;
pub use customization::CustomizationWaiter;
pub use directory::DirectoryLock;
pub use types::{ObservedState, ProvisionState, UpdateOutcome, VirtualMachineSpec, VmIdentity};
pub use workflow::{CreateError, VmLifecycle};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: ObjectKind, id: String },

    #[error("{operation} failed: {fault}")]
    RemoteFault { operation: &'static str, fault: Fault },

    #[error("timeout after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The remote task was not cancelled and may still complete.
    #[error("task {task} ({operation}) still running after {timeout:?}")]
    TaskTimeout {
        task: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("guest customization failed: {0}")]
    CustomizationFailed(String),

    #[error(
        "WARNING: Dangling resource!\n\
         There was an error configuring virtual machine {vm:?} after creating it:\n\
         {original}\n\
         Additionally, there was an error removing the virtual machine:\n\
         {cleanup}\n\
         You will need to remove this virtual machine manually before trying again."
    )]
    RollbackCompound {
        vm: String,
        original: Box<Error>,
        cleanup: Box<Error>,
    },

    #[error("vim api error: {0}")]
    Api(#[from] vim_api::Error),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Api(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::TaskTimeout { .. })
    }

    /// True when a VM was left behind and must be removed by hand.
    pub fn is_dangling(&self) -> bool {
        matches!(self, Self::RollbackCompound { .. })
    }

    /// The remote task a `TaskTimeout` gave up on. Await it again rather
    /// than resubmitting.
    pub fn pending_task(&self) -> Option<TaskHandle> {
        match self {
            Self::TaskTimeout { task, operation, .. } => Some(TaskHandle {
                id: task.clone(),
                operation: *operation,
            }),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle to a submitted remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: String,
    pub operation: &'static str,
}

pub type EventStream = BoxStream<'static, Result<Event>>;

/// Everything the lifecycle core needs from the virtualization endpoint.
///
/// Every method is a suspension point. Implementations own their transport
/// and configuration. `VimInventory` talks to a real endpoint.
#[async_trait]
pub trait Inventory: Send + Sync + 'static {
    /// Look up an inventory object by ID. VMs resolve by instance UUID.
    /// Missing objects yield `Error::NotFound`.
    async fn resolve(&self, kind: ObjectKind, id: &str) -> Result<ManagedObjectRef>;

    async fn properties(&self, vm: &ManagedObjectRef) -> Result<VmProperties>;

    async fn submit_task(&self, request: TaskRequest) -> Result<TaskHandle>;

    /// Wait for a task to finish. A fault yields `Error::RemoteFault`. Running
    /// past `timeout` yields `Error::TaskTimeout` and leaves the task alone.
    async fn await_task(&self, task: &TaskHandle, timeout: Duration) -> Result<Option<ManagedObjectRef>>;

    async fn subscribe_events(&self, object: &ManagedObjectRef, kinds: &[EventKind]) -> Result<EventStream>;

    async fn shutdown_guest(&self, vm: &ManagedObjectRef) -> Result<()>;

    /// Devices the platform adds implicitly to a new VM of `guest_id`.
    async fn default_devices(&self, pool: &ManagedObjectRef, guest_id: &str) -> Result<Vec<VirtualDevice>>;

    async fn guest_os_family(&self, pool: &ManagedObjectRef, guest_id: &str) -> Result<GuestOsFamily>;

    /// Create a datastore directory, parents included. Existing is success.
    async fn make_directory(&self, datastore: &ManagedObjectRef, path: &str) -> Result<()>;
}

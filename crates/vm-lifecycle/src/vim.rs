use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, info};
use vim_api::{
    EventKind, Fault, GuestOsFamily, ManagedObjectRef, ObjectKind, TaskRequest, TaskState,
    VimClient, VirtualDevice, VmProperties,
};

use crate::{Error, EventStream, Inventory, Result, TaskHandle};

/// Inventory backed by a live management endpoint.
///
/// Delegates to `vim_api::VimClient` for all HTTP calls.
pub struct VimInventory {
    client: VimClient,
    poll_interval: Duration,
}

impl VimInventory {
    pub fn new(client: VimClient, poll_interval: Duration) -> Self {
        Self { client, poll_interval }
    }

    /// Create from env vars: `VIM_API_URL` and `VIM_API_TOKEN` (required).
    pub fn from_env(poll_interval: Duration) -> Result<Self> {
        dotenvy::dotenv().ok();

        let url = std::env::var("VIM_API_URL").map_err(|_| Error::MissingEnv("VIM_API_URL".into()))?;
        let token =
            std::env::var("VIM_API_TOKEN").map_err(|_| Error::MissingEnv("VIM_API_TOKEN".into()))?;

        Ok(Self::new(VimClient::new(url, token), poll_interval))
    }

    async fn poll_task(&self, task: &TaskHandle) -> Result<Option<ManagedObjectRef>> {
        loop {
            let info = self.client.get_task(&task.id).await?;
            match info.state {
                TaskState::Success => return Ok(info.result),
                TaskState::Error => {
                    return Err(Error::RemoteFault {
                        operation: task.operation,
                        fault: info.error.unwrap_or_else(|| Fault {
                            fault_type: "UnknownFault".into(),
                            message: "task failed without a fault".into(),
                        }),
                    });
                }
                TaskState::Queued | TaskState::Running => {
                    debug!(task = %task.id, state = ?info.state, "vim: task pending");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    fn not_found(err: vim_api::Error, kind: ObjectKind, id: &str) -> Error {
        if err.is_not_found() {
            Error::NotFound {
                kind,
                id: id.to_string(),
            }
        } else {
            Error::Api(err)
        }
    }
}

#[async_trait]
impl Inventory for VimInventory {
    async fn resolve(&self, kind: ObjectKind, id: &str) -> Result<ManagedObjectRef> {
        self.client
            .find_object(kind, id)
            .await
            .map_err(|e| Self::not_found(e, kind, id))
    }

    async fn properties(&self, vm: &ManagedObjectRef) -> Result<VmProperties> {
        self.client
            .vm_properties(&vm.value)
            .await
            .map_err(|e| Self::not_found(e, ObjectKind::VirtualMachine, &vm.value))
    }

    async fn submit_task(&self, request: TaskRequest) -> Result<TaskHandle> {
        let task = self.client.submit_task(&request).await?;
        info!(task = %task.id, operation = request.operation(), "vim: task submitted");
        Ok(TaskHandle {
            id: task.id,
            operation: request.operation(),
        })
    }

    async fn await_task(&self, task: &TaskHandle, timeout: Duration) -> Result<Option<ManagedObjectRef>> {
        tokio::time::timeout(timeout, self.poll_task(task))
            .await
            .map_err(|_| Error::TaskTimeout {
                task: task.id.clone(),
                operation: task.operation,
                timeout,
            })?
    }

    async fn subscribe_events(&self, object: &ManagedObjectRef, kinds: &[EventKind]) -> Result<EventStream> {
        let events = self.client.subscribe_events(object, kinds).await?;
        Ok(events.map(|event| event.map_err(Error::from)).boxed())
    }

    async fn shutdown_guest(&self, vm: &ManagedObjectRef) -> Result<()> {
        self.client.shutdown_guest(&vm.value).await?;
        info!(vm = %vm.value, "vim: guest shutdown requested");
        Ok(())
    }

    async fn default_devices(&self, pool: &ManagedObjectRef, guest_id: &str) -> Result<Vec<VirtualDevice>> {
        Ok(self.client.default_devices(&pool.value, guest_id).await?)
    }

    async fn guest_os_family(&self, pool: &ManagedObjectRef, guest_id: &str) -> Result<GuestOsFamily> {
        Ok(self.client.guest_os(&pool.value, guest_id).await?.family)
    }

    async fn make_directory(&self, datastore: &ManagedObjectRef, path: &str) -> Result<()> {
        self.client.make_directory(&datastore.value, path).await?;
        debug!(datastore = %datastore.value, path, "vim: directory ensured");
        Ok(())
    }
}

//! Create, read, update and delete of a single VM.
//!
//! Create walks BareCreate/CloneCreate -> Configured -> PoweredOn -> Ready.
//! The VM's identity is recorded as soon as the endpoint reports it. Until
//! the post-create configuration pass and the customization submission
//! finish, any failure removes the VM again. Later failures, a failed
//! customization run included, leave it in place.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use vim_api::{
    CloneSpec, CustomizationSpec, DiskMoveType, Fault, ManagedObjectRef, ObjectKind, PowerState, RelocateSpec,
    TaskRequest, VmProperties,
};

use crate::config_spec;
use crate::customization::{CustomizationWaiter, customization_spec};
use crate::device::{BackingIndex, DirectoryRequest};
use crate::migrate::{self, Placement};
use crate::types::{
    CloneSettings, ObservedState, ProvisionState, UpdateOutcome, VirtualMachineSpec, VmIdentity,
};
use crate::vim::VimInventory;
use crate::{DirectoryLock, Error, Inventory, LifecycleConfig, Result};

pub(crate) fn minutes(n: i64) -> Duration {
    Duration::from_secs(u64::try_from(n).unwrap_or(0).saturating_mul(60))
}

/// A failed create. `identity` is set when the VM exists on the endpoint
/// and must be tracked by the caller.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct CreateError {
    pub identity: Option<VmIdentity>,
    #[source]
    pub source: Error,
}

/// Placement references resolved from a declaration.
struct Target {
    pool: ManagedObjectRef,
    host: Option<ManagedObjectRef>,
    datastore: ManagedObjectRef,
    folder: Option<ManagedObjectRef>,
}

impl Target {
    fn placement(&self) -> Placement {
        Placement {
            pool: self.pool.value.clone(),
            host: self.host.as_ref().map(|h| h.value.clone()),
            datastore: self.datastore.value.clone(),
        }
    }
}

struct Created {
    vm: ManagedObjectRef,
    identity: VmIdentity,
    waiter: Option<CustomizationWaiter>,
}

fn transition(vm: &str, state: ProvisionState) {
    info!(vm, state = %state, "create: state transition");
}

pub struct VmLifecycle {
    pub(crate) inventory: Arc<dyn Inventory>,
    pub(crate) config: LifecycleConfig,
    directories: DirectoryLock,
}

impl VmLifecycle {
    pub fn new(inventory: Arc<dyn Inventory>, config: LifecycleConfig) -> Self {
        Self {
            inventory,
            config,
            directories: DirectoryLock::new(),
        }
    }

    /// Share one directory lock between lifecycles talking to the same
    /// endpoint.
    pub fn with_directory_lock(mut self, lock: DirectoryLock) -> Self {
        self.directories = lock;
        self
    }

    /// Build from env vars. See [`LifecycleConfig::from_env`] and
    /// [`VimInventory::from_env`].
    pub fn from_env() -> Result<Self> {
        let config = LifecycleConfig::from_env()?;
        let inventory = VimInventory::from_env(config.task_poll_interval)?;
        Ok(Self::new(Arc::new(inventory), config))
    }

    // ── Helpers ──────────────────────────────────────────────────────

    pub(crate) async fn run_task(&self, request: TaskRequest) -> Result<Option<ManagedObjectRef>> {
        self.run_task_within(request, self.config.task_timeout).await
    }

    async fn run_task_within(&self, request: TaskRequest, timeout: Duration) -> Result<Option<ManagedObjectRef>> {
        let task = self.inventory.submit_task(request).await?;
        self.inventory.await_task(&task, timeout).await
    }

    /// Resolve an object the declaration names. Missing is a configuration
    /// error, not a lookup failure.
    async fn resolve_declared(&self, kind: ObjectKind, id: &str) -> Result<ManagedObjectRef> {
        self.inventory.resolve(kind, id).await.map_err(|e| {
            if e.is_not_found() {
                Error::Validation(format!("{kind} {id:?} not found"))
            } else {
                e
            }
        })
    }

    async fn resolve_vm(&self, identity: VmIdentity) -> Result<ManagedObjectRef> {
        self.inventory
            .resolve(ObjectKind::VirtualMachine, &identity.0.to_string())
            .await
    }

    async fn resolve_target(&self, desired: &VirtualMachineSpec) -> Result<Target> {
        let pool = self
            .resolve_declared(ObjectKind::ResourcePool, &desired.resource_pool_id)
            .await?;
        let host = match &desired.host_system_id {
            Some(id) => Some(self.resolve_declared(ObjectKind::HostSystem, id).await?),
            None => None,
        };
        let datastore = self
            .resolve_declared(ObjectKind::Datastore, &desired.datastore_id)
            .await?;
        let folder = match &desired.folder {
            Some(id) => Some(self.resolve_declared(ObjectKind::Folder, id).await?),
            None => None,
        };
        Ok(Target {
            pool,
            host,
            datastore,
            folder,
        })
    }

    async fn ensure_directories(&self, requests: &[DirectoryRequest]) -> Result<()> {
        for request in requests {
            let datastore = ManagedObjectRef::new(ObjectKind::Datastore, request.datastore.clone());
            let _guard = self.directories.acquire().await;
            self.inventory.make_directory(&datastore, &request.path).await?;
        }
        Ok(())
    }

    async fn reconfigure(&self, vm: &ManagedObjectRef, spec: vim_api::ConfigSpec) -> Result<()> {
        let changes = spec.device_change.len();
        self.run_task(TaskRequest::ReconfigureVm {
            vm: vm.value.clone(),
            spec,
        })
        .await?;
        info!(vm = %vm.value, device_changes = changes, "reconfigure: applied");
        Ok(())
    }

    // ── Create ───────────────────────────────────────────────────────

    /// Provision a VM and bring it to Ready.
    pub async fn create(&self, desired: &VirtualMachineSpec) -> std::result::Result<VmIdentity, CreateError> {
        let mut recorded = None;
        match self.provision(desired, &mut recorded).await {
            Ok(identity) => Ok(identity),
            Err(source) => Err(CreateError {
                identity: recorded,
                source,
            }),
        }
    }

    async fn provision(&self, desired: &VirtualMachineSpec, recorded: &mut Option<VmIdentity>) -> Result<VmIdentity> {
        config_spec::validate(desired)?;
        let target = self.resolve_target(desired).await?;

        let created = match &desired.clone {
            None => self.create_bare(desired, &target, recorded).await?,
            Some(clone) => self.create_clone(desired, clone, &target, recorded).await?,
        };
        let vm = &created.vm;

        self.power_on(vm).await?;
        transition(&vm.value, ProvisionState::PoweredOn);

        if let Some(waiter) = created.waiter {
            debug!(vm = %vm.value, "create: waiting for guest customization");
            waiter.wait().await?;
        }

        self.wait_for_guest_net(vm, desired.wait_for_guest_net_timeout_minutes)
            .await?;
        transition(&vm.value, ProvisionState::Ready);
        Ok(created.identity)
    }

    /// Fetch the new VM's identity. Failing here still leaves a VM behind,
    /// so it is removed.
    async fn record_identity(
        &self,
        vm: &ManagedObjectRef,
        desired: &VirtualMachineSpec,
        recorded: &mut Option<VmIdentity>,
    ) -> Result<VmProperties> {
        let props = match self.inventory.properties(vm).await {
            Ok(props) => props,
            Err(e) => return Err(self.rollback(vm, desired, e).await),
        };
        let identity = VmIdentity(props.config.uuid);
        *recorded = Some(identity);
        info!(vm = %vm.value, %identity, "create: identity recorded");
        Ok(props)
    }

    async fn create_bare(
        &self,
        desired: &VirtualMachineSpec,
        target: &Target,
        recorded: &mut Option<VmIdentity>,
    ) -> Result<Created> {
        // 1. Full configuration, devices diffed against the platform defaults
        let backings = BackingIndex::resolve(self.inventory.as_ref(), desired).await?;
        let defaults = self
            .inventory
            .default_devices(&target.pool, &desired.guest_id)
            .await?;
        let built = config_spec::for_create(desired, &defaults, &backings)?;
        self.ensure_directories(&built.directories).await?;

        // 2. Create
        info!(name = %desired.name, state = %ProvisionState::BareCreate, devices = built.spec.device_change.len(), "create: state transition");
        let vm = self
            .run_task(TaskRequest::CreateVm {
                folder: target.folder.as_ref().map(|f| f.value.clone()),
                pool: target.pool.value.clone(),
                host: target.host.as_ref().map(|h| h.value.clone()),
                config: built.spec,
            })
            .await?
            .ok_or_else(|| missing_result("create_vm"))?;

        // 3. Everything went in with the create
        let props = self.record_identity(&vm, desired, recorded).await?;
        transition(&vm.value, ProvisionState::Configured);

        Ok(Created {
            vm,
            identity: VmIdentity(props.config.uuid),
            waiter: None,
        })
    }

    async fn create_clone(
        &self,
        desired: &VirtualMachineSpec,
        clone: &CloneSettings,
        target: &Target,
        recorded: &mut Option<VmIdentity>,
    ) -> Result<Created> {
        // 1. Source checks, before anything exists remotely
        let source = self
            .resolve_declared(ObjectKind::VirtualMachine, &clone.template_uuid)
            .await?;
        let template = self.inventory.properties(&source).await?;
        if template.config.guest_id != desired.guest_id {
            return Err(Error::Validation(format!(
                "guest_id {:?} does not match the template's {:?}",
                desired.guest_id, template.config.guest_id
            )));
        }
        let (disk_move_type, snapshot) = if clone.linked_clone {
            let (kind, snapshot) = linked_clone_source(&template)?;
            (Some(kind), snapshot)
        } else {
            (None, None)
        };
        let backings = BackingIndex::resolve(self.inventory.as_ref(), desired).await?;
        config_spec::build(desired, None, &template.config, PowerState::PoweredOff, &backings)?;

        let customization = match &clone.customize {
            Some(settings) => {
                let family = self
                    .inventory
                    .guest_os_family(&target.pool, &desired.guest_id)
                    .await?;
                Some((customization_spec(settings, desired, family)?, settings.timeout_minutes))
            }
            None => None,
        };

        // 2. Clone, powered off, with the declared attributes
        info!(name = %desired.name, template = %source.value, state = %ProvisionState::CloneCreate, "create: state transition");
        let timeout = if clone.timeout_minutes > 0 {
            minutes(clone.timeout_minutes)
        } else {
            self.config.task_timeout
        };
        let request = TaskRequest::CloneVm {
            source: source.value.clone(),
            folder: target.folder.as_ref().map(|f| f.value.clone()),
            name: desired.name.clone(),
            spec: CloneSpec {
                location: RelocateSpec {
                    pool: Some(target.pool.value.clone()),
                    host: target.host.as_ref().map(|h| h.value.clone()),
                    datastore: Some(target.datastore.value.clone()),
                    disks: Vec::new(),
                    disk_move_type,
                },
                config: Some(config_spec::attributes(desired)),
                snapshot,
                power_on: false,
                template: false,
            },
        };
        let vm = self
            .run_task_within(request, timeout)
            .await?
            .ok_or_else(|| missing_result("clone_vm"))?;

        // 3. Record identity, then bring the clone's devices in line
        let props = self.record_identity(&vm, desired, recorded).await?;
        if let Err(e) = self.normalize_clone(&vm, &props, desired, &backings).await {
            return Err(self.abandon(&vm, desired, e, recorded).await);
        }
        let identity = VmIdentity(props.config.uuid);

        // 4. Customization is submitted before power-on, watched from here
        let waiter = match customization {
            Some((spec, timeout_minutes)) => match self.submit_customization(&vm, spec, timeout_minutes).await {
                Ok(waiter) => waiter,
                Err(e) => return Err(self.abandon(&vm, desired, e, recorded).await),
            },
            None => None,
        };
        transition(&vm.value, ProvisionState::Configured);

        Ok(Created { vm, identity, waiter })
    }

    /// Roll back a VM whose identity was already recorded. The identity
    /// survives only when the VM is left dangling.
    async fn abandon(
        &self,
        vm: &ManagedObjectRef,
        desired: &VirtualMachineSpec,
        cause: Error,
        recorded: &mut Option<VmIdentity>,
    ) -> Error {
        let err = self.rollback(vm, desired, cause).await;
        if !err.is_dangling() {
            *recorded = None;
        }
        err
    }

    /// Subscribe for the outcome, then submit.
    async fn submit_customization(
        &self,
        vm: &ManagedObjectRef,
        spec: CustomizationSpec,
        timeout_minutes: i64,
    ) -> Result<Option<CustomizationWaiter>> {
        let waiter = if timeout_minutes > 0 {
            Some(CustomizationWaiter::start(self.inventory.as_ref(), vm, minutes(timeout_minutes)).await?)
        } else {
            debug!(vm = %vm.value, "create: customization wait disabled");
            None
        };
        self.run_task(TaskRequest::CustomizeVm {
            vm: vm.value.clone(),
            spec,
        })
        .await?;
        info!(vm = %vm.value, "create: customization submitted");
        Ok(waiter)
    }

    /// Post-clone configuration pass. Skipped when the clone already
    /// matches.
    async fn normalize_clone(
        &self,
        vm: &ManagedObjectRef,
        props: &VmProperties,
        desired: &VirtualMachineSpec,
        backings: &BackingIndex,
    ) -> Result<()> {
        let built = config_spec::build(desired, None, &props.config, props.runtime.power_state, backings)?;
        if !built.changed() {
            debug!(vm = %vm.value, "create: clone already matches, no reconfigure");
            return Ok(());
        }
        self.ensure_directories(&built.directories).await?;
        self.reconfigure(vm, built.spec).await
    }

    // ── Read ─────────────────────────────────────────────────────────

    /// Observed state of the VM. A VM that no longer exists is
    /// `Error::NotFound`.
    pub async fn read(&self, identity: VmIdentity) -> Result<ObservedState> {
        let vm = self.resolve_vm(identity).await?;
        let props = self.inventory.properties(&vm).await?;
        Ok(ObservedState::from_properties(&props))
    }

    // ── Update ───────────────────────────────────────────────────────

    /// Converge an existing VM on `desired`. `previous` is the declaration
    /// the VM was last converged on.
    pub async fn update(
        &self,
        identity: VmIdentity,
        desired: &VirtualMachineSpec,
        previous: Option<&VirtualMachineSpec>,
    ) -> Result<UpdateOutcome> {
        let vm = self.resolve_vm(identity).await?;
        let target = self.resolve_target(desired).await?;
        let mut outcome = UpdateOutcome::default();
        let mut props = self.inventory.properties(&vm).await?;

        // 1. Folder
        if let Some(folder) = &target.folder {
            if props.folder.as_ref() != Some(&folder.value) {
                self.run_task(TaskRequest::MoveIntoFolder {
                    folder: folder.value.clone(),
                    vm: vm.value.clone(),
                })
                .await?;
                info!(vm = %vm.value, folder = %folder.value, "update: moved");
                outcome.moved = true;
            }
        }

        // 2. Configuration
        let backings = BackingIndex::resolve(self.inventory.as_ref(), desired).await?;
        let built = config_spec::build(desired, previous, &props.config, props.runtime.power_state, &backings)?;
        if built.changed() {
            if built.reboot_required && props.runtime.power_state != PowerState::PoweredOff {
                info!(vm = %vm.value, "update: change requires the VM to be powered off");
                self.graceful_power_off(&vm, desired.shutdown_wait_timeout_minutes, desired.force_power_off)
                    .await?;
                outcome.rebooted = true;
            }
            self.ensure_directories(&built.directories).await?;
            self.reconfigure(&vm, built.spec).await?;
            outcome.changed = true;

            props = self.inventory.properties(&vm).await?;
            if props.runtime.power_state != PowerState::PoweredOn {
                self.power_on(&vm).await?;
                self.wait_for_guest_net(&vm, desired.wait_for_guest_net_timeout_minutes)
                    .await?;
                props = self.inventory.properties(&vm).await?;
            }
        } else {
            debug!(vm = %vm.value, "update: configuration unchanged");
        }

        // 3. Placement
        let plan = migrate::plan(&props, &target.placement(), &desired.disks)?;
        if plan.needed {
            let timeout = minutes(desired.migrate_wait_timeout_minutes.max(1));
            self.relocate(&vm, plan.spec, timeout).await?;
            outcome.relocated = true;
        }

        info!(vm = %vm.value, changed = outcome.changed, rebooted = outcome.rebooted, relocated = outcome.relocated, "update: complete");
        Ok(outcome)
    }

    // ── Delete ───────────────────────────────────────────────────────

    /// Remove the VM. Disks `declared` marks keep-on-remove or attached are
    /// detached first. A VM that is already gone is not an error.
    pub async fn delete(&self, identity: VmIdentity, declared: Option<&VirtualMachineSpec>) -> Result<()> {
        let vm = match self.resolve_vm(identity).await {
            Ok(vm) => vm,
            Err(e) if e.is_not_found() => {
                warn!(%identity, "delete: virtual machine already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.destroy_vm(&vm, declared).await
    }
}

fn missing_result(operation: &'static str) -> Error {
    Error::RemoteFault {
        operation,
        fault: Fault {
            fault_type: "InvalidResponse".into(),
            message: "task completed without a virtual machine reference".into(),
        },
    }
}

/// Disk move type and snapshot for a linked clone of `source`.
fn linked_clone_source(source: &VmProperties) -> Result<(DiskMoveType, Option<String>)> {
    if source.config.template {
        return Ok((DiskMoveType::MoveAllDiskBackingsAndAllowSharing, None));
    }
    let single = source.snapshot.as_ref().and_then(|info| match info.root_snapshots.as_slice() {
        [root] if root.children.is_empty() && info.current_snapshot.as_ref() == Some(&root.snapshot) => {
            Some(root.snapshot.clone())
        }
        _ => None,
    });
    match single {
        Some(snapshot) => Ok((DiskMoveType::CreateNewChildDiskBacking, Some(snapshot))),
        None => Err(Error::Validation(format!(
            "linked clone source {:?} must be a template or have exactly one current snapshot with no children",
            source.config.name
        ))),
    }
}

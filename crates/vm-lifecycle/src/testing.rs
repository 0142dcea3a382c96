//! In-memory endpoint for tests. Records every task and property fetch,
//! applies task effects to its own VM table, and can be told to fail or
//! stall specific operations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;
use vim_api::{
    ConfigSpec, Event, EventKind, Fault, GuestInfo, GuestIpAddress, GuestIpRoute, GuestNicInfo,
    GuestOsFamily, IdeController, ManagedObjectRef, NicAdapterType, ObjectKind, PowerState,
    RuntimeInfo, ScsiBusSharing, ScsiController, ScsiControllerType, TaskRequest,
    ToolsRunningStatus, VirtualDevice, VirtualDisk, VirtualEthernetCard, VmConfigInfo,
    VmProperties,
};

use crate::device::apply_changes;
use crate::{Error, EventStream, Inventory, Result, TaskHandle};

enum TaskOutcome {
    Done(Option<ManagedObjectRef>),
    Failed(Fault),
    Stalled,
}

/// A `make_directory` call, with the number of tasks submitted before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MadeDirectory {
    pub datastore: String,
    pub path: String,
    pub after_tasks: usize,
}

pub(crate) struct State {
    pub vms: BTreeMap<String, VmProperties>,
    pub tasks: Vec<TaskRequest>,
    pub property_fetches: usize,
    pub directories: Vec<MadeDirectory>,
    pub default_devices: Vec<VirtualDevice>,
    pub guest_family: GuestOsFamily,
    /// Event emitted when a VM with pending customization powers on.
    pub customization_result: Option<(EventKind, String)>,
    /// Powered-on guests report a routable address.
    pub guest_net_ready: bool,
    /// Guest shutdown requests power the VM off.
    pub guest_shutdown_works: bool,
    objects: HashSet<(ObjectKind, String)>,
    failures: HashMap<&'static str, Fault>,
    stalled: HashSet<&'static str>,
    outcomes: HashMap<String, TaskOutcome>,
    subscribers: Vec<(String, mpsc::UnboundedSender<Result<Event>>)>,
    pending_customization: HashSet<String>,
    next_id: u32,
}

pub(crate) struct FakeInventory {
    state: Mutex<State>,
}

fn fault(message: &str) -> Fault {
    Fault {
        fault_type: "SystemError".into(),
        message: message.into(),
    }
}

impl FakeInventory {
    pub fn new() -> Self {
        let objects = [
            (ObjectKind::ResourcePool, "pool-1"),
            (ObjectKind::ResourcePool, "pool-2"),
            (ObjectKind::HostSystem, "host-1"),
            (ObjectKind::HostSystem, "host-2"),
            (ObjectKind::Datastore, "datastore-1"),
            (ObjectKind::Datastore, "datastore-2"),
            (ObjectKind::Network, "network-1"),
            (ObjectKind::Network, "network-2"),
            (ObjectKind::Folder, "folder-1"),
            (ObjectKind::Folder, "folder-2"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();

        Self {
            state: Mutex::new(State {
                vms: BTreeMap::new(),
                tasks: Vec::new(),
                property_fetches: 0,
                directories: Vec::new(),
                default_devices: vec![
                    VirtualDevice::Other { key: 100 },
                    VirtualDevice::IdeController(IdeController { key: 200, bus_number: 0 }),
                    VirtualDevice::IdeController(IdeController { key: 201, bus_number: 1 }),
                ],
                guest_family: GuestOsFamily::Linux,
                customization_result: Some((EventKind::CustomizationSucceeded, String::new())),
                guest_net_ready: true,
                guest_shutdown_works: true,
                objects,
                failures: HashMap::new(),
                stalled: HashSet::new(),
                outcomes: HashMap::new(),
                subscribers: Vec::new(),
                pending_customization: HashSet::new(),
                next_id: 1,
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// The next task for `operation` fails with `message`.
    pub fn fail(&self, operation: &'static str, message: &str) {
        self.with(|s| s.failures.insert(operation, fault(message)));
    }

    /// Tasks for `operation` never complete.
    pub fn stall(&self, operation: &'static str) {
        self.with(|s| s.stalled.insert(operation));
    }

    pub fn operations(&self) -> Vec<&'static str> {
        self.with(|s| s.tasks.iter().map(TaskRequest::operation).collect())
    }

    pub fn count(&self, operation: &str) -> usize {
        self.operations().iter().filter(|op| **op == operation).count()
    }

    pub fn property_fetches(&self) -> usize {
        self.with(|s| s.property_fetches)
    }

    pub fn vm(&self, moid: &str) -> Option<VmProperties> {
        self.with(|s| s.vms.get(moid).cloned())
    }

    pub fn vm_by_uuid(&self, uuid: Uuid) -> Option<VmProperties> {
        self.with(|s| s.vms.values().find(|p| p.config.uuid == uuid).cloned())
    }

    pub fn open_subscriptions(&self) -> usize {
        self.with(|s| s.subscribers.iter().filter(|(_, tx)| !tx.is_closed()).count())
    }

    pub fn emit(&self, moid: &str, kind: EventKind, message: &str) {
        self.with(|s| s.emit(moid, kind, message));
    }

    /// A powered-off template with one 20 GB disk on a paravirtual bus and
    /// one vmxnet3 NIC on `network-1`. Returns its UUID.
    pub fn add_template(&self) -> Uuid {
        let uuid = Uuid::new_v4();
        self.with(|s| {
            let moid = s.next_moid();
            s.vms.insert(
                moid.clone(),
                VmProperties {
                    vm: ManagedObjectRef::new(ObjectKind::VirtualMachine, moid),
                    config: VmConfigInfo {
                        name: "ubuntu-template".into(),
                        uuid,
                        guest_id: "ubuntu64Guest".into(),
                        template: true,
                        num_cpus: 1,
                        num_cores_per_socket: 1,
                        memory_mb: 1024,
                        cpu_hot_add_enabled: false,
                        memory_hot_add_enabled: false,
                        firmware: Default::default(),
                        efi_secure_boot_enabled: false,
                        boot_delay_ms: 0,
                        annotation: String::new(),
                        extra_config: BTreeMap::new(),
                        devices: vec![
                            VirtualDevice::ScsiController(ScsiController {
                                key: 1000,
                                bus_number: 0,
                                controller_type: ScsiControllerType::ParaVirtual,
                                sharing: ScsiBusSharing::NoSharing,
                            }),
                            VirtualDevice::Disk(VirtualDisk {
                                key: 2000,
                                controller_key: 1000,
                                unit_number: 0,
                                capacity_gb: 20,
                                datastore: "datastore-1".into(),
                                file_name: Some("ubuntu-template/disk0.vmdk".into()),
                                thin_provisioned: true,
                                eagerly_scrub: false,
                            }),
                            VirtualDevice::NetworkInterface(VirtualEthernetCard {
                                key: 4000,
                                adapter_type: NicAdapterType::Vmxnet3,
                                network: "network-1".into(),
                                mac_address: Some("00:50:56:00:00:01".into()),
                                manual_mac: false,
                            }),
                        ],
                    },
                    runtime: RuntimeInfo {
                        power_state: PowerState::PoweredOff,
                        host: None,
                    },
                    resource_pool: None,
                    datastore: Some("datastore-1".into()),
                    folder: None,
                    guest: None,
                    snapshot: None,
                },
            );
        });
        uuid
    }
}

impl State {
    fn next_moid(&mut self) -> String {
        let id = format!("vm-{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn emit(&mut self, moid: &str, kind: EventKind, message: &str) {
        let key = i64::from(self.next_id);
        self.next_id += 1;
        for (target, tx) in &self.subscribers {
            if target == moid {
                let _ = tx.send(Ok(Event {
                    key,
                    kind,
                    created_time: Default::default(),
                    vm: Some(ManagedObjectRef::new(ObjectKind::VirtualMachine, moid)),
                    full_formatted_message: message.into(),
                    log_location: None,
                }));
            }
        }
    }

    /// Give pending devices real keys, the way the endpoint does.
    fn settle(&mut self, devices: Vec<VirtualDevice>) -> Vec<VirtualDevice> {
        let mut devices = devices;
        let pending: Vec<i32> = devices.iter().map(VirtualDevice::key).filter(|k| *k < 0).collect();
        for old in pending {
            let new = 5000 + i32::try_from(self.next_id).unwrap_or(0);
            self.next_id += 1;
            for d in devices.iter_mut() {
                if d.key() == old {
                    d.set_key(new);
                }
                if d.controller_key() == Some(old) {
                    d.set_controller_key(new);
                }
            }
        }
        for d in devices.iter_mut() {
            if let VirtualDevice::NetworkInterface(nic) = d {
                if nic.mac_address.is_none() {
                    nic.mac_address = Some(format!("00:50:56:00:01:{:02x}", nic.key % 256));
                }
            }
        }
        devices
    }

    fn apply_config(&mut self, config: &mut VmConfigInfo, spec: &ConfigSpec) {
        if let Some(v) = &spec.name {
            config.name = v.clone();
        }
        if let Some(v) = &spec.guest_id {
            config.guest_id = v.clone();
        }
        if let Some(v) = spec.num_cpus {
            config.num_cpus = v;
        }
        if let Some(v) = spec.num_cores_per_socket {
            config.num_cores_per_socket = v;
        }
        if let Some(v) = spec.memory_mb {
            config.memory_mb = v;
        }
        if let Some(v) = spec.cpu_hot_add_enabled {
            config.cpu_hot_add_enabled = v;
        }
        if let Some(v) = spec.memory_hot_add_enabled {
            config.memory_hot_add_enabled = v;
        }
        if let Some(v) = spec.firmware {
            config.firmware = v;
        }
        if let Some(v) = spec.efi_secure_boot_enabled {
            config.efi_secure_boot_enabled = v;
        }
        if let Some(v) = spec.boot_delay_ms {
            config.boot_delay_ms = v;
        }
        if let Some(v) = &spec.annotation {
            config.annotation = v.clone();
        }
        for (k, v) in &spec.extra_config {
            if v.is_empty() {
                config.extra_config.remove(k);
            } else {
                config.extra_config.insert(k.clone(), v.clone());
            }
        }
        let devices = apply_changes(&config.devices, &spec.device_change);
        config.devices = self.settle(devices);
    }

    fn running_guest(&self) -> Option<GuestInfo> {
        self.guest_net_ready.then(|| GuestInfo {
            tools_running_status: ToolsRunningStatus::GuestToolsRunning,
            ip_address: Some("10.0.0.20".into()),
            host_name: None,
            net: vec![GuestNicInfo {
                mac_address: None,
                network: Some("network-1".into()),
                ip_addresses: vec![GuestIpAddress {
                    address: "10.0.0.20".into(),
                    prefix_length: 24,
                }],
            }],
            ip_routes: vec![GuestIpRoute {
                network: "0.0.0.0".into(),
                prefix_length: 0,
                gateway: Some("10.0.0.1".into()),
            }],
        })
    }

    fn vm_mut(&mut self, moid: &str) -> std::result::Result<&mut VmProperties, Fault> {
        self.vms
            .get_mut(moid)
            .ok_or_else(|| fault(&format!("managed object {moid} has been deleted")))
    }

    fn execute(&mut self, request: &TaskRequest) -> std::result::Result<Option<ManagedObjectRef>, Fault> {
        match request {
            TaskRequest::CreateVm { folder, pool, host, config } => {
                let moid = self.next_moid();
                let mut info = VmConfigInfo {
                    name: String::new(),
                    uuid: Uuid::new_v4(),
                    guest_id: String::new(),
                    template: false,
                    num_cpus: 1,
                    num_cores_per_socket: 1,
                    memory_mb: 1024,
                    cpu_hot_add_enabled: false,
                    memory_hot_add_enabled: false,
                    firmware: Default::default(),
                    efi_secure_boot_enabled: false,
                    boot_delay_ms: 0,
                    annotation: String::new(),
                    extra_config: BTreeMap::new(),
                    devices: self.default_devices.clone(),
                };
                self.apply_config(&mut info, config);
                let vm = ManagedObjectRef::new(ObjectKind::VirtualMachine, moid.clone());
                self.vms.insert(
                    moid,
                    VmProperties {
                        vm: vm.clone(),
                        config: info,
                        runtime: RuntimeInfo {
                            power_state: PowerState::PoweredOff,
                            host: host.clone(),
                        },
                        resource_pool: Some(pool.clone()),
                        datastore: config.vm_path_datastore.clone(),
                        folder: folder.clone(),
                        guest: None,
                        snapshot: None,
                    },
                );
                Ok(Some(vm))
            }
            TaskRequest::CloneVm { source, folder, name, spec } => {
                let mut props = self
                    .vms
                    .get(source)
                    .cloned()
                    .ok_or_else(|| fault("source not found"))?;
                let moid = self.next_moid();
                props.vm = ManagedObjectRef::new(ObjectKind::VirtualMachine, moid.clone());
                props.config.uuid = Uuid::new_v4();
                props.config.name = name.clone();
                props.config.template = false;
                props.snapshot = None;
                props.folder = folder.clone();
                props.runtime = RuntimeInfo {
                    power_state: PowerState::PoweredOff,
                    host: spec.location.host.clone(),
                };
                props.resource_pool = spec.location.pool.clone();
                if let Some(ds) = &spec.location.datastore {
                    props.datastore = Some(ds.clone());
                    for d in props.config.devices.iter_mut() {
                        if let VirtualDevice::Disk(disk) = d {
                            disk.datastore = ds.clone();
                        }
                    }
                }
                if let Some(config) = &spec.config {
                    let mut info = props.config.clone();
                    self.apply_config(&mut info, config);
                    props.config = info;
                }
                let vm = props.vm.clone();
                self.vms.insert(moid, props);
                Ok(Some(vm))
            }
            TaskRequest::ReconfigureVm { vm, spec } => {
                let mut info = self.vm_mut(vm)?.config.clone();
                self.apply_config(&mut info, spec);
                self.vm_mut(vm)?.config = info;
                Ok(None)
            }
            TaskRequest::CustomizeVm { vm, .. } => {
                self.vm_mut(vm)?;
                self.pending_customization.insert(vm.clone());
                Ok(None)
            }
            TaskRequest::PowerOnVm { vm } => {
                let guest = self.running_guest();
                let props = self.vm_mut(vm)?;
                props.runtime.power_state = PowerState::PoweredOn;
                props.guest = guest;
                if self.pending_customization.remove(vm) {
                    if let Some((kind, message)) = self.customization_result.clone() {
                        self.emit(vm, kind, &message);
                    }
                }
                Ok(None)
            }
            TaskRequest::PowerOffVm { vm } => {
                let props = self.vm_mut(vm)?;
                props.runtime.power_state = PowerState::PoweredOff;
                props.guest = None;
                Ok(None)
            }
            TaskRequest::RelocateVm { vm, spec } => {
                let props = self.vm_mut(vm)?;
                if let Some(pool) = &spec.pool {
                    props.resource_pool = Some(pool.clone());
                }
                if let Some(host) = &spec.host {
                    props.runtime.host = Some(host.clone());
                }
                if let Some(ds) = &spec.datastore {
                    props.datastore = Some(ds.clone());
                }
                for d in props.config.devices.iter_mut() {
                    if let VirtualDevice::Disk(disk) = d {
                        if let Some(loc) = spec.disks.iter().find(|l| l.disk_key == disk.key) {
                            disk.datastore = loc.datastore.clone();
                        } else if let Some(ds) = &spec.datastore {
                            disk.datastore = ds.clone();
                        }
                    }
                }
                Ok(None)
            }
            TaskRequest::MoveIntoFolder { folder, vm } => {
                self.vm_mut(vm)?.folder = Some(folder.clone());
                Ok(None)
            }
            TaskRequest::DestroyVm { vm } => {
                self.vms
                    .remove(vm)
                    .map(|_| None)
                    .ok_or_else(|| fault("already deleted"))
            }
        }
    }
}

#[async_trait]
impl Inventory for FakeInventory {
    async fn resolve(&self, kind: ObjectKind, id: &str) -> Result<ManagedObjectRef> {
        self.with(|s| {
            if kind == ObjectKind::VirtualMachine {
                return s
                    .vms
                    .values()
                    .find(|p| p.config.uuid.to_string() == id)
                    .map(|p| p.vm.clone())
                    .ok_or_else(|| Error::NotFound {
                        kind,
                        id: id.to_string(),
                    });
            }
            if s.objects.contains(&(kind, id.to_string())) {
                Ok(ManagedObjectRef::new(kind, id))
            } else {
                Err(Error::NotFound {
                    kind,
                    id: id.to_string(),
                })
            }
        })
    }

    async fn properties(&self, vm: &ManagedObjectRef) -> Result<VmProperties> {
        self.with(|s| {
            s.property_fetches += 1;
            s.vms.get(&vm.value).cloned().ok_or_else(|| Error::NotFound {
                kind: ObjectKind::VirtualMachine,
                id: vm.value.clone(),
            })
        })
    }

    async fn submit_task(&self, request: TaskRequest) -> Result<TaskHandle> {
        self.with(|s| {
            let operation = request.operation();
            let id = format!("task-{}", s.next_id);
            s.next_id += 1;
            let outcome = if s.stalled.contains(operation) {
                TaskOutcome::Stalled
            } else if let Some(fault) = s.failures.remove(operation) {
                TaskOutcome::Failed(fault)
            } else {
                match s.execute(&request) {
                    Ok(result) => TaskOutcome::Done(result),
                    Err(fault) => TaskOutcome::Failed(fault),
                }
            };
            s.tasks.push(request);
            s.outcomes.insert(id.clone(), outcome);
            Ok(TaskHandle { id, operation })
        })
    }

    async fn await_task(&self, task: &TaskHandle, timeout: Duration) -> Result<Option<ManagedObjectRef>> {
        let outcome = self.with(|s| match s.outcomes.get(&task.id) {
            Some(TaskOutcome::Done(result)) => Some(Ok(result.clone())),
            Some(TaskOutcome::Failed(fault)) => Some(Err(Error::RemoteFault {
                operation: task.operation,
                fault: fault.clone(),
            })),
            Some(TaskOutcome::Stalled) | None => None,
        });
        match outcome {
            Some(result) => result,
            None => {
                tokio::time::sleep(timeout).await;
                Err(Error::TaskTimeout {
                    task: task.id.clone(),
                    operation: task.operation,
                    timeout,
                })
            }
        }
    }

    async fn subscribe_events(&self, object: &ManagedObjectRef, _kinds: &[EventKind]) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with(|s| s.subscribers.push((object.value.clone(), tx)));
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }

    async fn shutdown_guest(&self, vm: &ManagedObjectRef) -> Result<()> {
        self.with(|s| {
            let works = s.guest_shutdown_works;
            if let Some(props) = s.vms.get_mut(&vm.value) {
                if works {
                    props.runtime.power_state = PowerState::PoweredOff;
                    props.guest = None;
                }
            }
        });
        Ok(())
    }

    async fn default_devices(&self, _pool: &ManagedObjectRef, _guest_id: &str) -> Result<Vec<VirtualDevice>> {
        Ok(self.with(|s| s.default_devices.clone()))
    }

    async fn guest_os_family(&self, _pool: &ManagedObjectRef, _guest_id: &str) -> Result<GuestOsFamily> {
        Ok(self.with(|s| s.guest_family))
    }

    async fn make_directory(&self, datastore: &ManagedObjectRef, path: &str) -> Result<()> {
        self.with(|s| {
            let after_tasks = s.tasks.len();
            s.directories.push(MadeDirectory {
                datastore: datastore.value.clone(),
                path: path.to_string(),
                after_tasks,
            })
        });
        Ok(())
    }
}

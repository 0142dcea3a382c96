use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Inventory references ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    VirtualMachine,
    ResourcePool,
    HostSystem,
    Datastore,
    Network,
    Folder,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VirtualMachine => "virtual_machine",
            Self::ResourcePool => "resource_pool",
            Self::HostSystem => "host_system",
            Self::Datastore => "datastore",
            Self::Network => "network",
            Self::Folder => "folder",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle to an inventory object, as issued by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedObjectRef {
    pub kind: ObjectKind,
    pub value: String,
}

impl ManagedObjectRef {
    pub fn new(kind: ObjectKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

// ── Devices ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScsiControllerType {
    #[default]
    #[serde(rename = "pvscsi")]
    ParaVirtual,
    #[serde(rename = "lsilogic")]
    LsiLogic,
    #[serde(rename = "lsilogic-sas")]
    LsiLogicSas,
    #[serde(rename = "buslogic")]
    BusLogic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScsiBusSharing {
    #[default]
    NoSharing,
    VirtualSharing,
    PhysicalSharing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicAdapterType {
    #[default]
    Vmxnet3,
    E1000,
    E1000e,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiController {
    pub key: i32,
    pub bus_number: u32,
    pub controller_type: ScsiControllerType,
    pub sharing: ScsiBusSharing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdeController {
    pub key: i32,
    pub bus_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDisk {
    pub key: i32,
    pub controller_key: i32,
    pub unit_number: u32,
    pub capacity_gb: u64,
    /// Datastore holding the backing file.
    pub datastore: String,
    /// Backing file path relative to the datastore. Assigned by the endpoint
    /// when absent on add.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default)]
    pub thin_provisioned: bool,
    #[serde(default)]
    pub eagerly_scrub: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualEthernetCard {
    pub key: i32,
    pub adapter_type: NicAdapterType,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// True when the MAC was set by the caller instead of generated.
    #[serde(default)]
    pub manual_mac: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CdromBacking {
    Iso { datastore: String, path: String },
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualCdrom {
    pub key: i32,
    pub controller_key: i32,
    pub unit_number: u32,
    pub backing: CdromBacking,
}

/// Closed set of device kinds the lifecycle core manages. Anything else the
/// endpoint reports (video cards, input devices, PCI buses) arrives as
/// `Other` and is never touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VirtualDevice {
    ScsiController(ScsiController),
    IdeController(IdeController),
    Disk(VirtualDisk),
    NetworkInterface(VirtualEthernetCard),
    OpticalDrive(VirtualCdrom),
    Other { key: i32 },
}

impl VirtualDevice {
    pub fn key(&self) -> i32 {
        match self {
            Self::ScsiController(c) => c.key,
            Self::IdeController(c) => c.key,
            Self::Disk(d) => d.key,
            Self::NetworkInterface(n) => n.key,
            Self::OpticalDrive(c) => c.key,
            Self::Other { key } => *key,
        }
    }

    pub fn set_key(&mut self, key: i32) {
        match self {
            Self::ScsiController(c) => c.key = key,
            Self::IdeController(c) => c.key = key,
            Self::Disk(d) => d.key = key,
            Self::NetworkInterface(n) => n.key = key,
            Self::OpticalDrive(c) => c.key = key,
            Self::Other { key: k } => *k = key,
        }
    }

    /// Key of the controller this device is attached to, if any.
    pub fn controller_key(&self) -> Option<i32> {
        match self {
            Self::Disk(d) => Some(d.controller_key),
            Self::OpticalDrive(c) => Some(c.controller_key),
            _ => None,
        }
    }

    pub fn set_controller_key(&mut self, key: i32) {
        match self {
            Self::Disk(d) => d.controller_key = key,
            Self::OpticalDrive(c) => c.controller_key = key,
            _ => {}
        }
    }

    pub fn unit_number(&self) -> Option<u32> {
        match self {
            Self::Disk(d) => Some(d.unit_number),
            Self::OpticalDrive(c) => Some(c.unit_number),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceOperation {
    Add,
    Edit,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Destroy,
}

/// One entry of a configuration delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceChange {
    pub operation: DeviceOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_operation: Option<FileOperation>,
    pub device: VirtualDevice,
}

impl DeviceChange {
    pub fn add(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Add,
            file_operation: None,
            device,
        }
    }

    pub fn create(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Add,
            file_operation: Some(FileOperation::Create),
            device,
        }
    }

    pub fn edit(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Edit,
            file_operation: None,
            device,
        }
    }

    pub fn remove(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Remove,
            file_operation: None,
            device,
        }
    }

    pub fn destroy(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Remove,
            file_operation: Some(FileOperation::Destroy),
            device,
        }
    }
}

// ── Configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Bios,
    Efi,
}

/// Partial configuration: every absent field means "leave unchanged".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cores_per_socket: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_hot_add_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_hot_add_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Firmware>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi_secure_boot_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    /// Entries to set. An empty value removes the key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_config: BTreeMap<String, String>,
    /// Datastore for the configuration file. Only meaningful on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_path_datastore: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_change: Vec<DeviceChange>,
}

impl ConfigSpec {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiskMoveType {
    MoveAllDiskBackingsAndAllowSharing,
    CreateNewChildDiskBacking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLocator {
    pub disk_key: i32,
    pub datastore: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskLocator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_move_type: Option<DiskMoveType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSpec {
    pub location: RelocateSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigSpec>,
    /// Snapshot to clone from (linked clones of non-template sources).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    pub power_on: bool,
    pub template: bool,
}

// ── Guest customization ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CustomizationIdentity {
    LinuxPrep {
        host_name: String,
        domain: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_zone: Option<String>,
        hw_clock_utc: bool,
    },
    Sysprep {
        computer_name: String,
        full_name: String,
        organization_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        admin_password: Option<String>,
        time_zone: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        product_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        join_domain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        domain_admin_user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        domain_admin_password: Option<String>,
        auto_logon: bool,
        auto_logon_count: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IpAssignment {
    Dhcp,
    Fixed { address: String, prefix_length: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    pub ipv4: IpAssignment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<IpAssignment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomizationSpec {
    pub identity: CustomizationIdentity,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub dns_suffixes: Vec<String>,
    pub nic_settings: Vec<AdapterMapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestOsFamily {
    Linux,
    Windows,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestOsDescriptor {
    pub id: String,
    pub family: GuestOsFamily,
}

// ── Tasks ────────────────────────────────────────────────────────────

/// Every mutating call is a remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum TaskRequest {
    CreateVm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder: Option<String>,
        pool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        config: ConfigSpec,
    },
    CloneVm {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder: Option<String>,
        name: String,
        spec: CloneSpec,
    },
    ReconfigureVm {
        vm: String,
        spec: ConfigSpec,
    },
    CustomizeVm {
        vm: String,
        spec: CustomizationSpec,
    },
    PowerOnVm {
        vm: String,
    },
    PowerOffVm {
        vm: String,
    },
    RelocateVm {
        vm: String,
        spec: RelocateSpec,
    },
    MoveIntoFolder {
        folder: String,
        vm: String,
    },
    DestroyVm {
        vm: String,
    },
}

impl TaskRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::CreateVm { .. } => "create_vm",
            Self::CloneVm { .. } => "clone_vm",
            Self::ReconfigureVm { .. } => "reconfigure_vm",
            Self::CustomizeVm { .. } => "customize_vm",
            Self::PowerOnVm { .. } => "power_on_vm",
            Self::PowerOffVm { .. } => "power_off_vm",
            Self::RelocateVm { .. } => "relocate_vm",
            Self::MoveIntoFolder { .. } => "move_into_folder",
            Self::DestroyVm { .. } => "destroy_vm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub fault_type: String,
    pub message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.fault_type, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub state: TaskState,
    #[serde(default)]
    pub result: Option<ManagedObjectRef>,
    #[serde(default)]
    pub error: Option<Fault>,
}

// ── Properties ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolsRunningStatus {
    GuestToolsRunning,
    #[default]
    GuestToolsNotRunning,
    GuestToolsExecutingScripts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestIpAddress {
    pub address: String,
    pub prefix_length: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestNicInfo {
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<GuestIpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestIpRoute {
    pub network: String,
    pub prefix_length: u8,
    #[serde(default)]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInfo {
    #[serde(default)]
    pub tools_running_status: ToolsRunningStatus,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub net: Vec<GuestNicInfo>,
    #[serde(default)]
    pub ip_routes: Vec<GuestIpRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTree {
    pub snapshot: String,
    #[serde(default)]
    pub children: Vec<SnapshotTree>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    #[serde(default)]
    pub current_snapshot: Option<String>,
    #[serde(default)]
    pub root_snapshots: Vec<SnapshotTree>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfigInfo {
    pub name: String,
    pub uuid: Uuid,
    pub guest_id: String,
    #[serde(default)]
    pub template: bool,
    pub num_cpus: u32,
    pub num_cores_per_socket: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub cpu_hot_add_enabled: bool,
    #[serde(default)]
    pub memory_hot_add_enabled: bool,
    #[serde(default)]
    pub firmware: Firmware,
    #[serde(default)]
    pub efi_secure_boot_enabled: bool,
    #[serde(default)]
    pub boot_delay_ms: u64,
    #[serde(default)]
    pub annotation: String,
    #[serde(default)]
    pub extra_config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: Vec<VirtualDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub power_state: PowerState,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmProperties {
    #[serde(rename = "self")]
    pub vm: ManagedObjectRef,
    pub config: VmConfigInfo,
    pub runtime: RuntimeInfo,
    #[serde(default)]
    pub resource_pool: Option<String>,
    /// Datastore holding the VM's configuration file.
    #[serde(default)]
    pub datastore: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub guest: Option<GuestInfo>,
    #[serde(default)]
    pub snapshot: Option<SnapshotInfo>,
}

// ── Events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    CustomizationStartedEvent,
    CustomizationSucceeded,
    CustomizationFailed,
    CustomizationLinuxIdentityFailed,
    CustomizationNetworkSetupFailed,
    CustomizationSysprepFailed,
    CustomizationUnknownFailure,
    #[serde(other)]
    Other,
}

impl EventKind {
    /// Events a guest customization run reports.
    pub const CUSTOMIZATION: &'static [EventKind] = &[
        Self::CustomizationStartedEvent,
        Self::CustomizationSucceeded,
        Self::CustomizationFailed,
        Self::CustomizationLinuxIdentityFailed,
        Self::CustomizationNetworkSetupFailed,
        Self::CustomizationSysprepFailed,
        Self::CustomizationUnknownFailure,
    ];

    pub fn is_customization_failure(&self) -> bool {
        matches!(
            self,
            Self::CustomizationFailed
                | Self::CustomizationLinuxIdentityFailed
                | Self::CustomizationNetworkSetupFailed
                | Self::CustomizationSysprepFailed
                | Self::CustomizationUnknownFailure
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub key: i64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub vm: Option<ManagedObjectRef>,
    #[serde(default)]
    pub full_formatted_message: String,
    #[serde(default)]
    pub log_location: Option<String>,
}

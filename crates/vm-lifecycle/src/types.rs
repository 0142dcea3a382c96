use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vim_api::{
    CdromBacking, Firmware, NicAdapterType, PowerState, ScsiBusSharing, ScsiControllerType,
    ToolsRunningStatus, VirtualDevice, VmProperties,
};

use crate::device::{self, DeviceAddress};

/// Durable identity of a VM. Survives renames, moves, and migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmIdentity(pub Uuid);

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a VM is in its provisioning sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    BareCreate,
    CloneCreate,
    Configured,
    PoweredOn,
    Ready,
}

impl ProvisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BareCreate => "bare_create",
            Self::CloneCreate => "clone_create",
            Self::Configured => "configured",
            Self::PoweredOn => "powered_on",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Desired state ────────────────────────────────────────────────────

/// Declared state of one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMachineSpec {
    pub name: String,
    /// Folder ID. `None` leaves the VM in whatever folder the endpoint put
    /// it in and never moves it.
    pub folder: Option<String>,
    pub resource_pool_id: String,
    pub host_system_id: Option<String>,
    pub datastore_id: String,

    pub guest_id: String,
    pub num_cpus: u32,
    pub num_cores_per_socket: u32,
    pub memory_mb: u64,
    pub cpu_hot_add_enabled: bool,
    pub memory_hot_add_enabled: bool,
    pub firmware: Firmware,
    pub efi_secure_boot_enabled: bool,
    pub boot_delay_ms: u64,
    pub annotation: String,
    pub extra_config: BTreeMap<String, String>,
    pub cloud_init: Option<CloudInit>,

    pub scsi: ScsiBusSpec,
    pub disks: Vec<DiskSpec>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub cdroms: Vec<CdromSpec>,

    pub clone: Option<CloneSettings>,

    pub shutdown_wait_timeout_minutes: i64,
    pub force_power_off: bool,
    /// Zero or negative skips the guest network wait.
    pub wait_for_guest_net_timeout_minutes: i64,
    pub migrate_wait_timeout_minutes: i64,
}

impl Default for VirtualMachineSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            folder: None,
            resource_pool_id: String::new(),
            host_system_id: None,
            datastore_id: String::new(),
            guest_id: "otherGuest64".into(),
            num_cpus: 1,
            num_cores_per_socket: 1,
            memory_mb: 1024,
            cpu_hot_add_enabled: false,
            memory_hot_add_enabled: false,
            firmware: Firmware::Bios,
            efi_secure_boot_enabled: false,
            boot_delay_ms: 0,
            annotation: String::new(),
            extra_config: BTreeMap::new(),
            cloud_init: None,
            scsi: ScsiBusSpec::default(),
            disks: Vec::new(),
            network_interfaces: Vec::new(),
            cdroms: Vec::new(),
            clone: None,
            shutdown_wait_timeout_minutes: 3,
            force_power_off: true,
            wait_for_guest_net_timeout_minutes: 5,
            migrate_wait_timeout_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInit {
    pub user_data: String,
    #[serde(default)]
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScsiBusSpec {
    pub controller_type: ScsiControllerType,
    pub bus_sharing: ScsiBusSharing,
    pub controller_count: u32,
}

impl Default for ScsiBusSpec {
    fn default() -> Self {
        Self {
            controller_type: ScsiControllerType::ParaVirtual,
            bus_sharing: ScsiBusSharing::NoSharing,
            controller_count: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSpec {
    pub label: String,
    pub size_gb: u64,
    /// Explicit SCSI slot. Unaddressed disks take the lowest free slot.
    pub address: Option<DeviceAddress>,
    /// Defaults to the VM's datastore.
    pub datastore_id: Option<String>,
    pub path: Option<String>,
    pub create_directories: bool,
    pub thin_provisioned: bool,
    pub eagerly_scrub: bool,
    /// Detach instead of deleting the backing file when removed.
    pub keep_on_remove: bool,
    /// Attach an existing file at `path`. The file is never created or deleted.
    pub attach: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterfaceSpec {
    pub network_id: String,
    pub adapter_type: NicAdapterType,
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdromSpec {
    pub datastore_id: Option<String>,
    pub path: Option<String>,
    pub client_device: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneSettings {
    pub template_uuid: String,
    pub linked_clone: bool,
    pub timeout_minutes: i64,
    pub customize: Option<CustomizeSettings>,
}

impl Default for CloneSettings {
    fn default() -> Self {
        Self {
            template_uuid: String::new(),
            linked_clone: false,
            timeout_minutes: 30,
            customize: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomizeSettings {
    pub linux: Option<LinuxOptions>,
    pub windows: Option<WindowsOptions>,
    pub dns_servers: Vec<String>,
    pub dns_suffixes: Vec<String>,
    pub ipv4_gateway: Option<String>,
    pub ipv6_gateway: Option<String>,
    /// Per-NIC IP settings, matched to declared NICs by position.
    pub network_interfaces: Vec<CustomizeInterface>,
    /// Zero or negative skips the wait for customization to finish.
    pub timeout_minutes: i64,
}

impl Default for CustomizeSettings {
    fn default() -> Self {
        Self {
            linux: None,
            windows: None,
            dns_servers: Vec::new(),
            dns_suffixes: Vec::new(),
            ipv4_gateway: None,
            ipv6_gateway: None,
            network_interfaces: Vec::new(),
            timeout_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxOptions {
    pub host_name: Option<String>,
    pub domain: String,
    pub time_zone: Option<String>,
    pub hw_clock_utc: bool,
}

impl Default for LinuxOptions {
    fn default() -> Self {
        Self {
            host_name: None,
            domain: String::new(),
            time_zone: None,
            hw_clock_utc: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowsOptions {
    pub computer_name: Option<String>,
    pub full_name: String,
    pub organization_name: String,
    pub admin_password: Option<String>,
    pub time_zone: i32,
    pub product_key: Option<String>,
    pub join_domain: Option<String>,
    pub domain_admin_user: Option<String>,
    pub domain_admin_password: Option<String>,
    pub auto_logon: bool,
    pub auto_logon_count: u32,
}

impl Default for WindowsOptions {
    fn default() -> Self {
        Self {
            computer_name: None,
            full_name: "Administrator".into(),
            organization_name: "Managed".into(),
            admin_password: None,
            time_zone: 85,
            product_key: None,
            join_domain: None,
            domain_admin_user: None,
            domain_admin_password: None,
            auto_logon: false,
            auto_logon_count: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomizeInterface {
    pub ipv4_address: Option<String>,
    pub ipv4_prefix_length: u8,
    pub ipv6_address: Option<String>,
    pub ipv6_prefix_length: u8,
}

// ── Results ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// A reconfiguration was submitted.
    pub changed: bool,
    /// The VM was shut down to apply the change.
    pub rebooted: bool,
    pub moved: bool,
    pub relocated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedDisk {
    pub key: i32,
    pub address: DeviceAddress,
    pub size_gb: u64,
    pub datastore_id: String,
    pub file_name: Option<String>,
    pub thin_provisioned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedNic {
    pub key: i32,
    pub network_id: String,
    pub adapter_type: NicAdapterType,
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedCdrom {
    pub key: i32,
    pub backing: CdromBacking,
}

/// Snapshot of a VM as reported by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedState {
    pub identity: VmIdentity,
    pub moid: String,
    pub name: String,
    pub guest_id: String,
    pub num_cpus: u32,
    pub num_cores_per_socket: u32,
    pub memory_mb: u64,
    pub cpu_hot_add_enabled: bool,
    pub memory_hot_add_enabled: bool,
    pub firmware: Firmware,
    pub annotation: String,
    pub power_state: PowerState,
    pub tools_running: bool,
    pub resource_pool_id: Option<String>,
    pub host_system_id: Option<String>,
    pub datastore_id: Option<String>,
    pub folder: Option<String>,
    pub scsi: Option<ScsiBusSpec>,
    pub disks: Vec<ObservedDisk>,
    pub network_interfaces: Vec<ObservedNic>,
    pub cdroms: Vec<ObservedCdrom>,
    pub default_ip_address: Option<String>,
    pub guest_ip_addresses: Vec<String>,
}

impl ObservedState {
    pub fn from_properties(props: &VmProperties) -> Self {
        let config = &props.config;
        let devices = &config.devices;

        let disks = device::scsi_disks(devices)
            .into_iter()
            .map(|(address, d)| ObservedDisk {
                key: d.key,
                address,
                size_gb: d.capacity_gb,
                datastore_id: d.datastore.clone(),
                file_name: d.file_name.clone(),
                thin_provisioned: d.thin_provisioned,
            })
            .collect();

        let mut network_interfaces: Vec<ObservedNic> = devices
            .iter()
            .filter_map(|d| match d {
                VirtualDevice::NetworkInterface(n) => Some(ObservedNic {
                    key: n.key,
                    network_id: n.network.clone(),
                    adapter_type: n.adapter_type,
                    mac_address: n.mac_address.clone(),
                }),
                _ => None,
            })
            .collect();
        network_interfaces.sort_by_key(|n| n.key);

        let cdroms = devices
            .iter()
            .filter_map(|d| match d {
                VirtualDevice::OpticalDrive(c) => Some(ObservedCdrom {
                    key: c.key,
                    backing: c.backing.clone(),
                }),
                _ => None,
            })
            .collect();

        let guest = props.guest.as_ref();
        let guest_ip_addresses = guest
            .map(|g| {
                g.net
                    .iter()
                    .flat_map(|nic| nic.ip_addresses.iter().map(|ip| ip.address.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            identity: VmIdentity(config.uuid),
            moid: props.vm.value.clone(),
            name: config.name.clone(),
            guest_id: config.guest_id.clone(),
            num_cpus: config.num_cpus,
            num_cores_per_socket: config.num_cores_per_socket,
            memory_mb: config.memory_mb,
            cpu_hot_add_enabled: config.cpu_hot_add_enabled,
            memory_hot_add_enabled: config.memory_hot_add_enabled,
            firmware: config.firmware,
            annotation: config.annotation.clone(),
            power_state: props.runtime.power_state,
            tools_running: guest
                .is_some_and(|g| g.tools_running_status == ToolsRunningStatus::GuestToolsRunning),
            resource_pool_id: props.resource_pool.clone(),
            host_system_id: props.runtime.host.clone(),
            datastore_id: props.datastore.clone(),
            folder: props.folder.clone(),
            scsi: device::bus::observe(devices).map(|bus| ScsiBusSpec {
                controller_type: bus.controller_type,
                bus_sharing: bus.sharing,
                controller_count: bus.controller_count,
            }),
            disks,
            network_interfaces,
            cdroms,
            default_ip_address: crate::net::routable_address(guest).map(|ip| ip.to_string()),
            guest_ip_addresses,
        }
    }
}

//! Builds the partial configuration that moves a VM from its observed
//! state to the declared one.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use vim_api::{ConfigSpec, PowerState, VirtualDevice, VmConfigInfo};

use crate::device::{self, BackingIndex, BusState, DirectoryRequest};
use crate::types::VirtualMachineSpec;
use crate::Result;

/// A computed configuration delta.
#[derive(Debug, Clone)]
pub struct BuiltSpec {
    pub spec: ConfigSpec,
    /// The delta cannot be applied to a running VM.
    pub reboot_required: bool,
    pub bus: BusState,
    pub directories: Vec<DirectoryRequest>,
}

impl BuiltSpec {
    pub fn changed(&self) -> bool {
        !self.spec.is_empty()
    }
}

/// Extra-config entries the declaration owns, cloud-init included.
fn declared_extra_config(desired: &VirtualMachineSpec) -> BTreeMap<String, String> {
    let mut entries = desired.extra_config.clone();
    if let Some(ci) = &desired.cloud_init {
        entries.insert("guestinfo.userdata".into(), BASE64.encode(&ci.user_data));
        entries.insert("guestinfo.userdata.encoding".into(), "base64".into());
        if let Some(metadata) = &ci.metadata {
            entries.insert("guestinfo.metadata".into(), BASE64.encode(metadata));
            entries.insert("guestinfo.metadata.encoding".into(), "base64".into());
        }
    }
    entries
}

/// Every declared attribute, without devices. Used where the VM is being
/// created and there is nothing to diff against.
pub fn attributes(desired: &VirtualMachineSpec) -> ConfigSpec {
    ConfigSpec {
        name: Some(desired.name.clone()),
        guest_id: Some(desired.guest_id.clone()),
        num_cpus: Some(desired.num_cpus),
        num_cores_per_socket: Some(desired.num_cores_per_socket),
        memory_mb: Some(desired.memory_mb),
        cpu_hot_add_enabled: Some(desired.cpu_hot_add_enabled),
        memory_hot_add_enabled: Some(desired.memory_hot_add_enabled),
        firmware: Some(desired.firmware),
        efi_secure_boot_enabled: Some(desired.efi_secure_boot_enabled),
        boot_delay_ms: Some(desired.boot_delay_ms),
        annotation: Some(desired.annotation.clone()),
        extra_config: declared_extra_config(desired),
        ..Default::default()
    }
}

/// Full configuration for a new VM. The device delta is computed against
/// the devices the platform adds on its own.
pub fn for_create(
    desired: &VirtualMachineSpec,
    default_devices: &[VirtualDevice],
    backings: &BackingIndex,
) -> Result<BuiltSpec> {
    validate(desired)?;
    backings.check_datastore(&desired.datastore_id, "virtual machine")?;
    let devices = device::reconcile(
        default_devices,
        None,
        desired.devices(),
        &desired.datastore_id,
        backings,
    )?;

    let mut spec = attributes(desired);
    spec.vm_path_datastore = Some(desired.datastore_id.clone());
    spec.device_change = devices.changes;

    Ok(BuiltSpec {
        spec,
        reboot_required: false,
        bus: devices.bus,
        directories: devices.directories,
    })
}

pub(crate) fn validate(desired: &VirtualMachineSpec) -> Result<()> {
    use crate::Error::Validation;

    if desired.name.is_empty() {
        return Err(Validation("name must be set".into()));
    }
    if desired.num_cpus == 0 || desired.memory_mb == 0 {
        return Err(Validation("num_cpus and memory_mb must be positive".into()));
    }
    if desired.num_cores_per_socket == 0 || desired.num_cpus % desired.num_cores_per_socket != 0 {
        return Err(Validation(format!(
            "num_cpus ({}) must be a multiple of num_cores_per_socket ({})",
            desired.num_cpus, desired.num_cores_per_socket
        )));
    }
    if desired.efi_secure_boot_enabled && desired.firmware != vim_api::Firmware::Efi {
        return Err(Validation("efi_secure_boot_enabled requires efi firmware".into()));
    }
    Ok(())
}

/// Delta from `observed` to `desired`.
///
/// `previous` is the last declared state: extra-config keys it owned that
/// are no longer declared get cleared, and disks it marked keep-on-remove
/// are detached rather than destroyed.
pub fn build(
    desired: &VirtualMachineSpec,
    previous: Option<&VirtualMachineSpec>,
    observed: &VmConfigInfo,
    power_state: PowerState,
    backings: &BackingIndex,
) -> Result<BuiltSpec> {
    validate(desired)?;

    let running = power_state != PowerState::PoweredOff;
    let mut spec = ConfigSpec::default();
    let mut reboot_required = false;

    if desired.name != observed.name {
        spec.name = Some(desired.name.clone());
    }
    if desired.guest_id != observed.guest_id {
        spec.guest_id = Some(desired.guest_id.clone());
        reboot_required = true;
    }

    if desired.num_cpus != observed.num_cpus {
        spec.num_cpus = Some(desired.num_cpus);
        if running && (!observed.cpu_hot_add_enabled || desired.num_cpus < observed.num_cpus) {
            reboot_required = true;
        }
    }
    if desired.memory_mb != observed.memory_mb {
        spec.memory_mb = Some(desired.memory_mb);
        if running && (!observed.memory_hot_add_enabled || desired.memory_mb < observed.memory_mb) {
            reboot_required = true;
        }
    }
    if desired.num_cores_per_socket != observed.num_cores_per_socket {
        spec.num_cores_per_socket = Some(desired.num_cores_per_socket);
        reboot_required = true;
    }
    if desired.cpu_hot_add_enabled != observed.cpu_hot_add_enabled {
        spec.cpu_hot_add_enabled = Some(desired.cpu_hot_add_enabled);
        reboot_required = true;
    }
    if desired.memory_hot_add_enabled != observed.memory_hot_add_enabled {
        spec.memory_hot_add_enabled = Some(desired.memory_hot_add_enabled);
        reboot_required = true;
    }
    if desired.firmware != observed.firmware {
        spec.firmware = Some(desired.firmware);
        reboot_required = true;
    }
    if desired.efi_secure_boot_enabled != observed.efi_secure_boot_enabled {
        spec.efi_secure_boot_enabled = Some(desired.efi_secure_boot_enabled);
        reboot_required = true;
    }
    if desired.boot_delay_ms != observed.boot_delay_ms {
        spec.boot_delay_ms = Some(desired.boot_delay_ms);
    }
    if desired.annotation != observed.annotation {
        spec.annotation = Some(desired.annotation.clone());
    }

    let declared = declared_extra_config(desired);
    for (key, value) in &declared {
        if observed.extra_config.get(key) != Some(value) {
            spec.extra_config.insert(key.clone(), value.clone());
        }
    }
    if let Some(prev) = previous {
        for key in declared_extra_config(prev).into_keys() {
            let still_set = observed.extra_config.get(&key).is_some_and(|v| !v.is_empty());
            if !declared.contains_key(&key) && still_set {
                spec.extra_config.insert(key, String::new());
            }
        }
    }

    let devices = device::reconcile(
        &observed.devices,
        previous.map(VirtualMachineSpec::devices),
        desired.devices(),
        &desired.datastore_id,
        backings,
    )?;
    spec.device_change = devices.changes;

    Ok(BuiltSpec {
        spec,
        reboot_required: reboot_required || devices.reboot_required,
        bus: devices.bus,
        directories: devices.directories,
    })
}

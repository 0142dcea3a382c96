use std::collections::BTreeSet;

use tracing::{error, info, warn};
use vim_api::{ConfigSpec, DeviceChange, ManagedObjectRef, PowerState, TaskRequest, VirtualDevice};

use crate::device::{bus, disk, scsi_disks};
use crate::types::VirtualMachineSpec;
use crate::{Error, Result, VmLifecycle};

impl VmLifecycle {
    /// Power off, detach preserved disks, destroy.
    ///
    /// Disks the declaration marks keep-on-remove or attached are detached
    /// first so destroying the VM leaves their files behind.
    pub(crate) async fn destroy_vm(
        &self,
        vm: &ManagedObjectRef,
        declared: Option<&VirtualMachineSpec>,
    ) -> Result<()> {
        let props = self.inventory.properties(vm).await?;

        if props.runtime.power_state != PowerState::PoweredOff {
            let timeout = declared.map_or(3, |d| d.shutdown_wait_timeout_minutes);
            self.graceful_power_off(vm, timeout, true).await?;
        }

        let detach = match declared {
            Some(declared) => preserved_disks(&props.config.devices, declared)?,
            None => Vec::new(),
        };
        if !detach.is_empty() {
            info!(vm = %vm.value, disks = detach.len(), "delete: detaching preserved disks");
            self.run_task(TaskRequest::ReconfigureVm {
                vm: vm.value.clone(),
                spec: ConfigSpec {
                    device_change: detach,
                    ..Default::default()
                },
            })
            .await?;
        }

        self.run_task(TaskRequest::DestroyVm { vm: vm.value.clone() }).await?;
        info!(vm = %vm.value, "delete: destroyed");
        Ok(())
    }

    /// Remove a VM that failed before it was fully configured.
    ///
    /// Returns the error to surface: `original` when cleanup worked,
    /// `Error::RollbackCompound` carrying both failures when it did not.
    pub(crate) async fn rollback(
        &self,
        vm: &ManagedObjectRef,
        declared: &VirtualMachineSpec,
        original: Error,
    ) -> Error {
        warn!(vm = %vm.value, error = %original, "rollback: removing partially configured VM");
        match self.destroy_vm(vm, Some(declared)).await {
            Ok(()) => {
                info!(vm = %vm.value, "rollback: VM removed");
                original
            }
            Err(cleanup) => {
                error!(vm = %vm.value, error = %cleanup, "rollback: cleanup failed, VM left dangling");
                Error::RollbackCompound {
                    vm: declared.name.clone(),
                    original: Box::new(original),
                    cleanup: Box::new(cleanup),
                }
            }
        }
    }
}

/// Remove changes for observed disks sitting in slots the declaration asks
/// to preserve. Files are left alone.
fn preserved_disks(devices: &[VirtualDevice], declared: &VirtualMachineSpec) -> Result<Vec<DeviceChange>> {
    let buses: BTreeSet<u32> = bus::controller_buses(devices).into_values().collect();
    let addresses = disk::assign_addresses(&declared.disks, &buses)?;
    let keep: BTreeSet<_> = declared
        .disks
        .iter()
        .zip(addresses)
        .filter(|(d, _)| d.keep_on_remove || d.attach)
        .map(|(_, a)| a)
        .collect();

    Ok(scsi_disks(devices)
        .into_iter()
        .filter(|(addr, _)| keep.contains(addr))
        .map(|(_, d)| DeviceChange::remove(VirtualDevice::Disk(d.clone())))
        .collect())
}

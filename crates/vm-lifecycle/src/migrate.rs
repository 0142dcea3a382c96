//! Compute and storage relocation of an existing VM.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::info;
use vim_api::{DiskLocator, ManagedObjectRef, RelocateSpec, TaskRequest, VmProperties};

use crate::device::{bus, disk, scsi_disks};
use crate::types::DiskSpec;
use crate::{Result, TaskHandle, VmLifecycle};

/// Where a VM should live: pool, optional host and the datastore holding its
/// configuration files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub pool: String,
    pub host: Option<String>,
    pub datastore: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationPlan {
    pub spec: RelocateSpec,
    pub needed: bool,
}

/// Work out the single relocation that moves `current` to `desired`.
///
/// Disks are matched to declarations by slot. A disk with its own datastore
/// gets a locator when that differs from the VM's. Attached disks are pinned
/// to where they are.
pub fn plan(current: &VmProperties, desired: &Placement, disks: &[DiskSpec]) -> Result<RelocationPlan> {
    let devices = &current.config.devices;
    let buses: BTreeSet<u32> = bus::controller_buses(devices).into_values().collect();
    let addresses = disk::assign_addresses(disks, &buses)?;
    let observed = scsi_disks(devices);

    let mut needed = current.resource_pool.as_deref() != Some(desired.pool.as_str())
        || current.datastore.as_deref() != Some(desired.datastore.as_str());
    if let Some(host) = &desired.host {
        needed |= current.runtime.host.as_ref() != Some(host);
    }

    let mut locators = Vec::new();
    for (spec, address) in disks.iter().zip(addresses) {
        let Some((_, disk)) = observed.iter().find(|(a, _)| *a == address) else {
            continue;
        };
        let target = if spec.attach {
            disk.datastore.as_str()
        } else {
            spec.datastore_id.as_deref().unwrap_or(&desired.datastore)
        };
        needed |= disk.datastore != target;
        if target != desired.datastore {
            locators.push(DiskLocator {
                disk_key: disk.key,
                datastore: target.to_string(),
            });
        }
    }

    if !needed {
        return Ok(RelocationPlan {
            spec: RelocateSpec::default(),
            needed,
        });
    }

    Ok(RelocationPlan {
        spec: RelocateSpec {
            pool: Some(desired.pool.clone()),
            host: desired.host.clone(),
            datastore: Some(desired.datastore.clone()),
            disks: locators,
            disk_move_type: None,
        },
        needed,
    })
}

impl VmLifecycle {
    /// Submit one relocation and wait for it. On timeout the task keeps
    /// running; `Error::pending_task` hands it back for
    /// [`VmLifecycle::await_relocation`].
    pub async fn relocate(&self, vm: &ManagedObjectRef, spec: RelocateSpec, timeout: Duration) -> Result<()> {
        let task = self
            .inventory
            .submit_task(TaskRequest::RelocateVm {
                vm: vm.value.clone(),
                spec,
            })
            .await?;
        info!(vm = %vm.value, task = %task.id, ?timeout, "migrate: relocation submitted");
        self.await_relocation(&task, timeout).await
    }

    pub async fn await_relocation(&self, task: &TaskHandle, timeout: Duration) -> Result<()> {
        self.inventory.await_task(task, timeout).await?;
        info!(task = %task.id, "migrate: relocation complete");
        Ok(())
    }
}

use std::collections::{BTreeSet, HashMap, HashSet};

use vim_api::{DeviceChange, VirtualDevice, VirtualDisk};

use super::{
    BackingIndex, ControllerMap, DeviceAddress, DirectoryRequest, SCSI_RESERVED_UNIT,
    SCSI_UNITS_PER_BUS, Workspace, scsi_disks,
};
use crate::types::DiskSpec;
use crate::{Error, Result};

fn label(disk: &DiskSpec, index: usize) -> String {
    if disk.label.is_empty() {
        format!("disk{index}")
    } else {
        disk.label.clone()
    }
}

/// Slot of every declared disk, in declaration order.
///
/// Explicit addresses are validated first. Unaddressed disks then take the
/// lowest free slot on the available buses, skipping the reserved unit.
pub(crate) fn assign_addresses(disks: &[DiskSpec], buses: &BTreeSet<u32>) -> Result<Vec<DeviceAddress>> {
    let mut taken = HashSet::new();
    for (i, disk) in disks.iter().enumerate() {
        let Some(addr) = disk.address else { continue };
        if addr.unit == SCSI_RESERVED_UNIT {
            return Err(Error::Validation(format!(
                "{}: unit {SCSI_RESERVED_UNIT} is reserved for the SCSI controller",
                label(disk, i)
            )));
        }
        if addr.unit >= SCSI_UNITS_PER_BUS {
            return Err(Error::Validation(format!(
                "{}: unit {} is out of range (max {})",
                label(disk, i),
                addr.unit,
                SCSI_UNITS_PER_BUS - 1
            )));
        }
        if !buses.contains(&addr.bus) {
            return Err(Error::Validation(format!(
                "{}: bus {} has no SCSI controller",
                label(disk, i),
                addr.bus
            )));
        }
        if !taken.insert(addr) {
            return Err(Error::Validation(format!("{}: duplicate disk address {addr}", label(disk, i))));
        }
    }

    let mut free = buses.iter().flat_map(|bus| {
        (0..SCSI_UNITS_PER_BUS)
            .filter(|unit| *unit != SCSI_RESERVED_UNIT)
            .map(move |unit| DeviceAddress::new(*bus, unit))
    });

    let mut out = Vec::with_capacity(disks.len());
    for (i, disk) in disks.iter().enumerate() {
        match disk.address {
            Some(addr) => out.push(addr),
            None => {
                let addr = free.find(|a| !taken.contains(a)).ok_or_else(|| {
                    Error::Validation(format!(
                        "{}: no free SCSI slot ({} controller(s) attached)",
                        label(disk, i),
                        buses.len()
                    ))
                })?;
                out.push(addr);
            }
        }
    }
    Ok(out)
}

/// Parent directory of a datastore-relative file path.
fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(dir, _)| dir).filter(|dir| !dir.is_empty())
}

/// True when the disk in a declared slot is not the one declared there:
/// another file, another attached datastore, or a switch between created
/// and attached since the last declaration.
fn replaced(spec: &DiskSpec, current: &VirtualDisk, previous: Option<&DiskSpec>) -> bool {
    if previous.is_some_and(|p| p.attach != spec.attach) {
        return true;
    }
    if spec.attach {
        if let Some(ds) = &spec.datastore_id {
            if *ds != current.datastore {
                return true;
            }
        }
    }
    spec.path
        .as_deref()
        .is_some_and(|path| current.file_name.as_deref() != Some(path))
}

fn detach_or_destroy(disk: &VirtualDisk, preserve: bool) -> DeviceChange {
    let device = VirtualDevice::Disk(disk.clone());
    if preserve {
        DeviceChange::remove(device)
    } else {
        DeviceChange::destroy(device)
    }
}

pub(super) fn reconcile(
    ws: &mut Workspace,
    controllers: &ControllerMap,
    previous: Option<&[DiskSpec]>,
    desired: &[DiskSpec],
    default_datastore: &str,
    backings: &BackingIndex,
    directories: &mut Vec<DirectoryRequest>,
) -> Result<Vec<DeviceChange>> {
    let buses: BTreeSet<u32> = controllers.keys().copied().collect();
    let addresses = assign_addresses(desired, &buses)?;

    // Last declared disk at each slot.
    let previous_at: HashMap<DeviceAddress, &DiskSpec> = previous
        .and_then(|prev| {
            let addrs = assign_addresses(prev, &buses).ok()?;
            Some(addrs.into_iter().zip(prev).collect())
        })
        .unwrap_or_default();
    let preserved = |addr: &DeviceAddress| {
        previous_at
            .get(addr)
            .is_some_and(|d| d.keep_on_remove || d.attach)
    };

    let observed: HashMap<DeviceAddress, VirtualDisk> = scsi_disks(ws.devices())
        .into_iter()
        .map(|(addr, d)| (addr, d.clone()))
        .collect();

    let mut removes = Vec::new();
    let mut rest = Vec::new();

    let claimed: HashSet<DeviceAddress> = addresses.iter().copied().collect();
    let mut unclaimed: Vec<_> = observed.iter().filter(|(a, _)| !claimed.contains(a)).collect();
    unclaimed.sort_by_key(|(a, _)| **a);
    for (addr, disk) in unclaimed {
        removes.push(detach_or_destroy(disk, preserved(addr)));
    }

    for (i, (spec, addr)) in desired.iter().zip(&addresses).enumerate() {
        let name = label(spec, i);
        if let Some(ds) = &spec.datastore_id {
            backings.check_datastore(ds, &name)?;
        }
        if spec.attach && spec.path.is_none() {
            return Err(Error::Validation(format!("{name}: attach requires a path")));
        }
        if !spec.attach && spec.size_gb == 0 {
            return Err(Error::Validation(format!("{name}: size_gb must be set")));
        }

        match observed.get(addr) {
            Some(current) if !replaced(spec, current, previous_at.get(addr).copied()) => {
                if spec.attach {
                    continue;
                }
                if spec.size_gb < current.capacity_gb {
                    return Err(Error::Validation(format!(
                        "{name}: virtual disks cannot be shrunk (old: {} new: {})",
                        current.capacity_gb, spec.size_gb
                    )));
                }
                if spec.size_gb > current.capacity_gb {
                    rest.push(DeviceChange::edit(VirtualDevice::Disk(VirtualDisk {
                        capacity_gb: spec.size_gb,
                        ..current.clone()
                    })));
                }
                continue;
            }
            Some(current) => removes.push(detach_or_destroy(current, preserved(addr))),
            None => {}
        }

        let datastore = spec.datastore_id.as_deref().unwrap_or(default_datastore);
        backings.check_datastore(datastore, &name)?;
        // Buses come from the controller map, so the lookup cannot miss.
        let Some(controller_key) = controllers.get(&addr.bus).copied() else {
            continue;
        };
        let device = VirtualDevice::Disk(VirtualDisk {
            key: ws.next_key(),
            controller_key,
            unit_number: addr.unit,
            capacity_gb: spec.size_gb,
            datastore: datastore.to_string(),
            file_name: spec.path.clone(),
            thin_provisioned: spec.thin_provisioned,
            eagerly_scrub: spec.eagerly_scrub,
        });
        if spec.attach {
            rest.push(DeviceChange::add(device));
        } else {
            if spec.create_directories {
                if let Some(dir) = spec.path.as_deref().and_then(parent_dir) {
                    directories.push(DirectoryRequest {
                        datastore: datastore.to_string(),
                        path: dir.to_string(),
                    });
                }
            }
            rest.push(DeviceChange::create(device));
        }
    }

    removes.extend(rest);
    for change in &removes {
        ws.apply(change);
    }
    Ok(removes)
}

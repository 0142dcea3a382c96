use std::collections::HashSet;

use vim_api::{CdromBacking, DeviceChange, VirtualCdrom, VirtualDevice};

use super::{BackingIndex, IDE_UNITS_PER_BUS, Workspace};
use crate::types::CdromSpec;
use crate::{Error, Result};

fn backing(spec: &CdromSpec, index: usize, backings: &BackingIndex) -> Result<CdromBacking> {
    let name = format!("cdrom {index}");
    match (spec.client_device, &spec.datastore_id, &spec.path) {
        (true, None, None) => Ok(CdromBacking::Client),
        (false, Some(datastore), Some(path)) => {
            backings.check_datastore(datastore, &name)?;
            Ok(CdromBacking::Iso {
                datastore: datastore.clone(),
                path: path.clone(),
            })
        }
        _ => Err(Error::Validation(format!(
            "{name}: set either client_device or both datastore_id and path"
        ))),
    }
}

/// Optical drives sit on IDE slots and are matched in slot order.
pub(super) fn reconcile(
    ws: &mut Workspace,
    desired: &[CdromSpec],
    backings: &BackingIndex,
) -> Result<Vec<DeviceChange>> {
    let wanted = desired
        .iter()
        .enumerate()
        .map(|(i, spec)| backing(spec, i, backings))
        .collect::<Result<Vec<_>>>()?;

    let mut ide: Vec<(u32, i32)> = ws
        .devices()
        .iter()
        .filter_map(|d| match d {
            VirtualDevice::IdeController(c) => Some((c.bus_number, c.key)),
            _ => None,
        })
        .collect();
    ide.sort();
    let ide_keys: HashSet<i32> = ide.iter().map(|(_, key)| *key).collect();
    let slot_of = |controller_key: i32, unit: u32| {
        ide.iter()
            .find(|(_, key)| *key == controller_key)
            .map(|(bus, _)| (*bus, unit))
    };

    let mut observed: Vec<VirtualCdrom> = ws
        .devices()
        .iter()
        .filter_map(|d| match d {
            VirtualDevice::OpticalDrive(c) if ide_keys.contains(&c.controller_key) => Some(c.clone()),
            _ => None,
        })
        .collect();
    observed.sort_by_key(|c| slot_of(c.controller_key, c.unit_number));

    let mut changes = Vec::new();

    for extra in observed.iter().skip(wanted.len()) {
        changes.push(DeviceChange::remove(VirtualDevice::OpticalDrive(extra.clone())));
    }

    let mut occupied: HashSet<(i32, u32)> = ws
        .devices()
        .iter()
        .filter(|d| !observed.iter().skip(wanted.len()).any(|o| o.key == d.key()))
        .filter_map(|d| Some((d.controller_key()?, d.unit_number()?)))
        .filter(|(key, _)| ide_keys.contains(key))
        .collect();

    for (i, backing) in wanted.into_iter().enumerate() {
        match observed.get(i) {
            Some(current) if current.backing == backing => {}
            Some(current) => {
                changes.push(DeviceChange::edit(VirtualDevice::OpticalDrive(VirtualCdrom {
                    backing,
                    ..current.clone()
                })));
            }
            None => {
                let slot = ide
                    .iter()
                    .flat_map(|(_, key)| (0..IDE_UNITS_PER_BUS).map(move |unit| (*key, unit)))
                    .find(|slot| !occupied.contains(slot))
                    .ok_or_else(|| Error::Validation(format!("cdrom {i}: no free IDE slot")))?;
                occupied.insert(slot);
                changes.push(DeviceChange::add(VirtualDevice::OpticalDrive(VirtualCdrom {
                    key: ws.next_key(),
                    controller_key: slot.0,
                    unit_number: slot.1,
                    backing,
                })));
            }
        }
    }

    for change in &changes {
        ws.apply(change);
    }
    Ok(changes)
}

use std::collections::HashMap;

use vim_api::{DeviceChange, ScsiBusSharing, ScsiController, ScsiControllerType, VirtualDevice};

use super::{ControllerMap, MAX_SCSI_CONTROLLERS, Workspace};
use crate::types::ScsiBusSpec;
use crate::{Error, Result};

/// SCSI bus layout of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusState {
    pub controller_type: ScsiControllerType,
    pub sharing: ScsiBusSharing,
    pub controller_count: u32,
}

pub(crate) struct BusNormalization {
    pub changes: Vec<DeviceChange>,
    pub controllers: ControllerMap,
    pub state: BusState,
    pub reboot_required: bool,
}

fn scsi_controllers(devices: &[VirtualDevice]) -> Vec<&ScsiController> {
    let mut controllers: Vec<_> = devices
        .iter()
        .filter_map(|d| match d {
            VirtualDevice::ScsiController(c) => Some(c),
            _ => None,
        })
        .collect();
    controllers.sort_by_key(|c| c.bus_number);
    controllers
}

/// Bus number of each SCSI controller, keyed by controller key.
pub(crate) fn controller_buses(devices: &[VirtualDevice]) -> HashMap<i32, u32> {
    scsi_controllers(devices)
        .into_iter()
        .map(|c| (c.key, c.bus_number))
        .collect()
}

/// Current bus state, taken from the lowest-numbered controller.
pub fn observe(devices: &[VirtualDevice]) -> Option<BusState> {
    let controllers = scsi_controllers(devices);
    let first = controllers.first()?;
    Some(BusState {
        controller_type: first.controller_type,
        sharing: first.sharing,
        controller_count: controllers.len() as u32,
    })
}

/// Bring every SCSI controller to the declared type and sharing mode and add
/// missing buses. Controllers are never removed, so the resulting count is
/// never below what is already attached.
pub(crate) fn normalize(ws: &mut Workspace, spec: &ScsiBusSpec) -> Result<BusNormalization> {
    if spec.controller_count == 0 || spec.controller_count > MAX_SCSI_CONTROLLERS {
        return Err(Error::Validation(format!(
            "scsi_controller_count must be between 1 and {MAX_SCSI_CONTROLLERS}, got {}",
            spec.controller_count
        )));
    }

    let mut changes = Vec::new();
    let mut reboot_required = false;

    let existing: Vec<ScsiController> = scsi_controllers(ws.devices()).into_iter().cloned().collect();
    for controller in &existing {
        if controller.controller_type != spec.controller_type || controller.sharing != spec.bus_sharing {
            let edited = ScsiController {
                controller_type: spec.controller_type,
                sharing: spec.bus_sharing,
                ..controller.clone()
            };
            tracing::debug!(
                bus = controller.bus_number,
                from = ?controller.controller_type,
                to = ?spec.controller_type,
                "scsi controller needs normalizing"
            );
            changes.push(DeviceChange::edit(VirtualDevice::ScsiController(edited)));
            reboot_required = true;
        }
    }

    for bus in 0..spec.controller_count {
        if existing.iter().any(|c| c.bus_number == bus) {
            continue;
        }
        let controller = ScsiController {
            key: ws.next_key(),
            bus_number: bus,
            controller_type: spec.controller_type,
            sharing: spec.bus_sharing,
        };
        changes.push(DeviceChange::add(VirtualDevice::ScsiController(controller)));
    }

    for change in &changes {
        ws.apply(change);
    }

    let controllers: ControllerMap = scsi_controllers(ws.devices())
        .into_iter()
        .map(|c| (c.bus_number, c.key))
        .collect();

    Ok(BusNormalization {
        changes,
        state: BusState {
            controller_type: spec.controller_type,
            sharing: spec.bus_sharing,
            controller_count: controllers.len() as u32,
        },
        controllers,
        reboot_required,
    })
}

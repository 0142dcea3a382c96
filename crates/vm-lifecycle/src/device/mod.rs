//! Device reconciliation: turns declared disks, NICs, CD-ROMs and the SCSI
//! bus into the add/edit/remove delta for one reconfiguration.
//!
//! Reconciliation is pure. Backing objects (datastores, networks) are
//! resolved up front into a [`BackingIndex`] so the diff itself never
//! touches the endpoint.

pub mod bus;
mod cdrom;
pub(crate) mod disk;
mod network;

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use vim_api::{DeviceChange, DeviceOperation, ObjectKind, VirtualDevice, VirtualDisk};

use crate::types::{CdromSpec, DiskSpec, NetworkInterfaceSpec, ScsiBusSpec, VirtualMachineSpec};
use crate::{Error, Inventory, Result};

pub use bus::BusState;

/// SCSI unit reserved for the controller itself.
pub const SCSI_RESERVED_UNIT: u32 = 7;
/// Units per SCSI controller, including the reserved one.
pub const SCSI_UNITS_PER_BUS: u32 = 16;
pub const MAX_SCSI_CONTROLLERS: u32 = 4;
pub const IDE_UNITS_PER_BUS: u32 = 2;

/// SCSI slot of a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub bus: u32,
    pub unit: u32,
}

impl DeviceAddress {
    pub fn new(bus: u32, unit: u32) -> Self {
        Self { bus, unit }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scsi:{}:{}", self.bus, self.unit)
    }
}

/// The device-related slice of a declared VM.
#[derive(Debug, Clone, Copy)]
pub struct DeclaredDevices<'a> {
    pub scsi: &'a ScsiBusSpec,
    pub disks: &'a [DiskSpec],
    pub network_interfaces: &'a [NetworkInterfaceSpec],
    pub cdroms: &'a [CdromSpec],
}

impl VirtualMachineSpec {
    pub fn devices(&self) -> DeclaredDevices<'_> {
        DeclaredDevices {
            scsi: &self.scsi,
            disks: &self.disks,
            network_interfaces: &self.network_interfaces,
            cdroms: &self.cdroms,
        }
    }
}

/// Datastores and networks known to exist on the endpoint.
#[derive(Debug, Clone, Default)]
pub struct BackingIndex {
    datastores: HashSet<String>,
    networks: HashSet<String>,
}

impl BackingIndex {
    pub fn new<D, N>(datastores: D, networks: N) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<String>,
    {
        Self {
            datastores: datastores.into_iter().map(Into::into).collect(),
            networks: networks.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolve every backing `desired` references. Unresolvable ones are
    /// left out and reported by the reconciler.
    pub async fn resolve(inventory: &dyn Inventory, desired: &VirtualMachineSpec) -> Result<Self> {
        let mut datastores: HashSet<&str> = HashSet::new();
        datastores.insert(&desired.datastore_id);
        for disk in &desired.disks {
            if let Some(ds) = &disk.datastore_id {
                datastores.insert(ds);
            }
        }
        for cdrom in &desired.cdroms {
            if let Some(ds) = &cdrom.datastore_id {
                datastores.insert(ds);
            }
        }
        let networks: HashSet<&str> = desired
            .network_interfaces
            .iter()
            .map(|n| n.network_id.as_str())
            .collect();

        let mut index = Self::default();
        for ds in datastores {
            if Self::exists(inventory, ObjectKind::Datastore, ds).await? {
                index.datastores.insert(ds.to_string());
            }
        }
        for net in networks {
            if Self::exists(inventory, ObjectKind::Network, net).await? {
                index.networks.insert(net.to_string());
            }
        }
        Ok(index)
    }

    async fn exists(inventory: &dyn Inventory, kind: ObjectKind, id: &str) -> Result<bool> {
        match inventory.resolve(kind, id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn check_datastore(&self, id: &str, device: &str) -> Result<()> {
        if self.datastores.contains(id) {
            Ok(())
        } else {
            Err(Error::Validation(format!("{device}: datastore {id:?} cannot be resolved")))
        }
    }

    pub(crate) fn check_network(&self, id: &str, device: &str) -> Result<()> {
        if self.networks.contains(id) {
            Ok(())
        } else {
            Err(Error::Validation(format!("{device}: network {id:?} cannot be resolved")))
        }
    }
}

/// A datastore directory that must exist before the delta is submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRequest {
    pub datastore: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub changes: Vec<DeviceChange>,
    /// Bus state once `changes` is applied.
    pub bus: BusState,
    pub reboot_required: bool,
    pub directories: Vec<DirectoryRequest>,
}

/// Compute the device delta that takes `existing` to `desired`.
///
/// `previous` is the last declared state, used for removal semantics of
/// disks that were declared keep-on-remove or attached. New disks without a
/// datastore land on `default_datastore`.
pub fn reconcile(
    existing: &[VirtualDevice],
    previous: Option<DeclaredDevices<'_>>,
    desired: DeclaredDevices<'_>,
    default_datastore: &str,
    backings: &BackingIndex,
) -> Result<Reconciliation> {
    let mut ws = Workspace::new(existing);
    let mut changes = Vec::new();
    let mut directories = Vec::new();

    let bus = bus::normalize(&mut ws, desired.scsi)?;
    changes.extend(bus.changes);

    changes.extend(disk::reconcile(
        &mut ws,
        &bus.controllers,
        previous.map(|p| p.disks),
        desired.disks,
        default_datastore,
        backings,
        &mut directories,
    )?);
    changes.extend(network::reconcile(&mut ws, desired.network_interfaces, backings)?);
    changes.extend(cdrom::reconcile(&mut ws, desired.cdroms, backings)?);

    Ok(Reconciliation {
        changes,
        bus: bus.state,
        reboot_required: bus.reboot_required,
        directories,
    })
}

/// Apply a delta to a device list. Added devices keep their pending keys.
pub fn apply_changes(devices: &[VirtualDevice], changes: &[DeviceChange]) -> Vec<VirtualDevice> {
    let mut out = devices.to_vec();
    for change in changes {
        let key = change.device.key();
        match change.operation {
            DeviceOperation::Add => out.push(change.device.clone()),
            DeviceOperation::Edit => {
                if let Some(slot) = out.iter_mut().find(|d| d.key() == key) {
                    *slot = change.device.clone();
                }
            }
            DeviceOperation::Remove => out.retain(|d| d.key() != key),
        }
    }
    out
}

/// Disks attached to SCSI controllers, by slot.
pub fn scsi_disks(devices: &[VirtualDevice]) -> Vec<(DeviceAddress, &VirtualDisk)> {
    let controllers = bus::controller_buses(devices);
    let mut disks: Vec<_> = devices
        .iter()
        .filter_map(|d| match d {
            VirtualDevice::Disk(disk) => controllers
                .get(&disk.controller_key)
                .map(|bus| (DeviceAddress::new(*bus, disk.unit_number), disk)),
            _ => None,
        })
        .collect();
    disks.sort_by_key(|(addr, _)| *addr);
    disks
}

/// Working copy of the device list that pending changes are applied to, so
/// each stage sees the result of the stages before it.
pub(crate) struct Workspace {
    devices: Vec<VirtualDevice>,
    next_key: i32,
}

impl Workspace {
    fn new(existing: &[VirtualDevice]) -> Self {
        let lowest = existing.iter().map(VirtualDevice::key).min().unwrap_or(0);
        Self {
            devices: existing.to_vec(),
            next_key: lowest.min(0) - 1,
        }
    }

    pub(crate) fn devices(&self) -> &[VirtualDevice] {
        &self.devices
    }

    /// Negative keys mark devices that do not exist yet.
    pub(crate) fn next_key(&mut self) -> i32 {
        let key = self.next_key;
        self.next_key -= 1;
        key
    }

    pub(crate) fn apply(&mut self, change: &DeviceChange) {
        self.devices = apply_changes(&self.devices, std::slice::from_ref(change));
    }
}

/// SCSI controller keys by bus number.
pub(crate) type ControllerMap = BTreeMap<u32, i32>;

#[cfg(test)]
mod tests {
    use super::*;
    use vim_api::{
        FileOperation, IdeController, NicAdapterType, ScsiBusSharing, ScsiController,
        ScsiControllerType, VirtualEthernetCard,
    };

    fn backings() -> BackingIndex {
        BackingIndex::new(["datastore-1", "datastore-2"], ["network-1", "network-2"])
    }

    fn pvscsi(key: i32, bus: u32) -> VirtualDevice {
        VirtualDevice::ScsiController(ScsiController {
            key,
            bus_number: bus,
            controller_type: ScsiControllerType::ParaVirtual,
            sharing: ScsiBusSharing::NoSharing,
        })
    }

    fn disk(key: i32, controller_key: i32, unit: u32, gb: u64) -> VirtualDevice {
        VirtualDevice::Disk(VirtualDisk {
            key,
            controller_key,
            unit_number: unit,
            capacity_gb: gb,
            datastore: "datastore-1".into(),
            file_name: None,
            thin_provisioned: false,
            eagerly_scrub: false,
        })
    }

    fn file(key: i32, controller_key: i32, unit: u32, gb: u64, name: &str) -> VirtualDevice {
        let VirtualDevice::Disk(d) = disk(key, controller_key, unit, gb) else {
            unreachable!()
        };
        VirtualDevice::Disk(VirtualDisk {
            file_name: Some(name.into()),
            ..d
        })
    }

    fn attached(path: &str) -> DiskSpec {
        DiskSpec {
            label: "shared".into(),
            path: Some(path.into()),
            attach: true,
            ..Default::default()
        }
    }

    fn nic(key: i32, network: &str, mac: &str) -> VirtualDevice {
        VirtualDevice::NetworkInterface(VirtualEthernetCard {
            key,
            adapter_type: NicAdapterType::Vmxnet3,
            network: network.into(),
            mac_address: Some(mac.into()),
            manual_mac: false,
        })
    }

    fn declared(disks: Vec<DiskSpec>, nics: Vec<NetworkInterfaceSpec>) -> VirtualMachineSpec {
        VirtualMachineSpec {
            datastore_id: "datastore-1".into(),
            disks,
            network_interfaces: nics,
            ..Default::default()
        }
    }

    fn sized(size_gb: u64) -> DiskSpec {
        DiskSpec {
            label: format!("disk-{size_gb}"),
            size_gb,
            ..Default::default()
        }
    }

    fn at(size_gb: u64, bus: u32, unit: u32) -> DiskSpec {
        DiskSpec {
            address: Some(DeviceAddress::new(bus, unit)),
            ..sized(size_gb)
        }
    }

    fn on(network: &str) -> NetworkInterfaceSpec {
        NetworkInterfaceSpec {
            network_id: network.into(),
            ..Default::default()
        }
    }

    /// Simulates the endpoint: pending keys become real ones.
    fn settle(devices: &[VirtualDevice], changes: &[DeviceChange]) -> Vec<VirtualDevice> {
        let mut out = apply_changes(devices, changes);
        let mut next = out.iter().map(VirtualDevice::key).max().unwrap_or(0).max(0) + 1;
        let pending: Vec<i32> = out.iter().map(VirtualDevice::key).filter(|k| *k < 0).collect();
        for old in pending {
            for d in out.iter_mut() {
                if d.key() == old {
                    d.set_key(next);
                }
                if d.controller_key() == Some(old) {
                    d.set_controller_key(next);
                }
            }
            next += 1;
        }
        out
    }

    #[test]
    fn matching_devices_produce_an_empty_delta() {
        let existing = vec![
            pvscsi(1000, 0),
            disk(2000, 1000, 0, 20),
            nic(4000, "network-1", "00:50:56:00:00:01"),
        ];
        let desired = declared(vec![sized(20)], vec![on("network-1")]);

        let rec = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap();

        assert!(rec.changes.is_empty());
        assert!(!rec.reboot_required);
        assert_eq!(rec.bus.controller_count, 1);
    }

    #[test]
    fn reconciling_against_the_result_is_a_fixed_point() {
        let existing = vec![pvscsi(1000, 0), disk(2000, 1000, 0, 20)];
        let mut desired = declared(
            vec![sized(40), sized(10), at(5, 1, 3)],
            vec![on("network-1"), on("network-2")],
        );
        desired.scsi.controller_count = 2;
        desired.scsi.bus_sharing = ScsiBusSharing::VirtualSharing;

        let first = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap();
        assert!(!first.changes.is_empty());

        let applied = settle(&existing, &first.changes);
        let second = reconcile(&applied, Some(desired.devices()), desired.devices(), "datastore-1", &backings())
            .unwrap();
        assert!(second.changes.is_empty(), "unexpected delta: {:?}", second.changes);
    }

    #[test]
    fn controller_count_never_shrinks() {
        let mut devices = vec![pvscsi(1000, 0)];
        let mut desired = declared(vec![], vec![]);

        for (want, expect) in [(2, 2), (1, 2), (3, 3), (1, 3)] {
            desired.scsi.controller_count = want;
            let rec = reconcile(&devices, None, desired.devices(), "datastore-1", &backings()).unwrap();
            assert_eq!(rec.bus.controller_count, expect);
            assert!(rec
                .changes
                .iter()
                .all(|c| c.operation != DeviceOperation::Remove));
            devices = settle(&devices, &rec.changes);
        }
    }

    #[test]
    fn controller_type_change_is_an_edit_that_needs_a_reboot() {
        let existing = vec![pvscsi(1000, 0), disk(2000, 1000, 0, 20)];
        let mut desired = declared(vec![sized(20)], vec![]);
        desired.scsi.controller_type = ScsiControllerType::LsiLogicSas;

        let rec = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap();

        assert!(rec.reboot_required);
        assert_eq!(rec.changes.len(), 1);
        assert_eq!(rec.changes[0].operation, DeviceOperation::Edit);
        assert!(matches!(
            &rec.changes[0].device,
            VirtualDevice::ScsiController(c) if c.controller_type == ScsiControllerType::LsiLogicSas
        ));
    }

    #[test]
    fn missing_controller_is_added_and_disks_attach_to_it() {
        let existing = vec![VirtualDevice::IdeController(IdeController { key: 200, bus_number: 0 })];
        let desired = declared(vec![sized(20)], vec![]);

        let rec = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap();

        assert_eq!(rec.changes.len(), 2);
        let controller_key = rec.changes[0].device.key();
        assert!(controller_key < 0);
        assert_eq!(rec.changes[1].file_operation, Some(FileOperation::Create));
        assert_eq!(rec.changes[1].device.controller_key(), Some(controller_key));
        assert!(rec.changes[1].device.key() < 0);
        assert_ne!(rec.changes[1].device.key(), controller_key);
    }

    #[test]
    fn unaddressed_disks_skip_the_reserved_unit() {
        let existing = vec![pvscsi(1000, 0)];
        let disks = (0..8).map(|_| sized(1)).collect();
        let desired = declared(disks, vec![]);

        let rec = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap();

        let units: Vec<u32> = rec.changes.iter().filter_map(|c| c.device.unit_number()).collect();
        assert_eq!(units, vec![0, 1, 2, 3, 4, 5, 6, 8]);
    }

    #[test]
    fn invalid_slots_are_rejected() {
        let existing = vec![pvscsi(1000, 0)];
        for spec in [at(1, 0, 7), at(1, 0, 16), at(1, 1, 0)] {
            let desired = declared(vec![spec], vec![]);
            let err = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{err}");
        }

        let desired = declared(vec![at(1, 0, 2), at(2, 0, 2)], vec![]);
        let err = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn full_bus_is_a_validation_error() {
        let existing = vec![pvscsi(1000, 0)];
        let disks = (0..16).map(|_| sized(1)).collect();
        let desired = declared(disks, vec![]);

        let err = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn disks_grow_but_never_shrink() {
        let existing = vec![pvscsi(1000, 0), disk(2000, 1000, 0, 20)];

        let grown = declared(vec![sized(30)], vec![]);
        let rec = reconcile(&existing, None, grown.devices(), "datastore-1", &backings()).unwrap();
        assert_eq!(rec.changes.len(), 1);
        assert_eq!(rec.changes[0].operation, DeviceOperation::Edit);
        assert!(matches!(&rec.changes[0].device, VirtualDevice::Disk(d) if d.capacity_gb == 30 && d.key == 2000));

        let shrunk = declared(vec![sized(10)], vec![]);
        let err = reconcile(&existing, None, shrunk.devices(), "datastore-1", &backings()).unwrap_err();
        assert!(err.to_string().contains("cannot be shrunk"), "{err}");
    }

    #[test]
    fn moved_slot_is_one_remove_and_one_add() {
        let existing = vec![pvscsi(1000, 0), disk(2000, 1000, 0, 10), disk(2001, 1000, 1, 20)];
        let desired = declared(vec![at(10, 0, 0), at(5, 0, 2)], vec![]);

        let rec = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap();

        let ops: Vec<_> = rec.changes.iter().map(|c| (c.operation, c.device.unit_number())).collect();
        assert_eq!(
            ops,
            vec![(DeviceOperation::Remove, Some(1)), (DeviceOperation::Add, Some(2))]
        );
    }

    #[test]
    fn removed_disks_are_destroyed_unless_kept() {
        let existing = vec![pvscsi(1000, 0), disk(2000, 1000, 0, 20), disk(2001, 1000, 1, 10)];
        let kept = DiskSpec {
            keep_on_remove: true,
            ..sized(10)
        };
        let previous = declared(vec![sized(20), kept], vec![]);
        let desired = declared(vec![sized(20)], vec![]);

        let rec = reconcile(&existing, Some(previous.devices()), desired.devices(), "datastore-1", &backings())
            .unwrap();
        assert_eq!(rec.changes.len(), 1);
        assert_eq!(rec.changes[0].operation, DeviceOperation::Remove);
        assert_eq!(rec.changes[0].file_operation, None);

        let rec = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap();
        assert_eq!(rec.changes[0].file_operation, Some(FileOperation::Destroy));
    }

    #[test]
    fn attaching_over_an_occupied_slot_replaces_the_disk() {
        let existing = vec![
            pvscsi(1000, 0),
            disk(2000, 1000, 0, 20),
            file(2001, 1000, 1, 10, "web-1/web-1_1.vmdk"),
        ];
        let previous = declared(vec![sized(20), sized(10)], vec![]);
        let desired = declared(vec![sized(20), attached("shared/data.vmdk")], vec![]);

        let rec = reconcile(&existing, Some(previous.devices()), desired.devices(), "datastore-1", &backings())
            .unwrap();

        assert_eq!(rec.changes.len(), 2);
        assert_eq!(rec.changes[0].operation, DeviceOperation::Remove);
        assert_eq!(rec.changes[0].file_operation, Some(FileOperation::Destroy));
        assert_eq!(rec.changes[0].device.key(), 2001);
        assert_eq!(rec.changes[1].operation, DeviceOperation::Add);
        assert_eq!(rec.changes[1].file_operation, None);
        assert!(matches!(
            &rec.changes[1].device,
            VirtualDevice::Disk(d) if d.unit_number == 1 && d.file_name.as_deref() == Some("shared/data.vmdk")
        ));
        assert!(rec.directories.is_empty());

        let applied = settle(&existing, &rec.changes);
        let again = reconcile(&applied, Some(desired.devices()), desired.devices(), "datastore-1", &backings())
            .unwrap();
        assert!(again.changes.is_empty(), "unexpected delta: {:?}", again.changes);
    }

    #[test]
    fn different_file_in_a_declared_slot_is_swapped() {
        let existing = vec![pvscsi(1000, 0), file(2000, 1000, 0, 20, "web-1/web-1.vmdk")];
        let desired = declared(
            vec![DiskSpec {
                path: Some("web-1/data.vmdk".into()),
                ..sized(20)
            }],
            vec![],
        );

        let rec = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap();
        let ops: Vec<_> = rec.changes.iter().map(|c| (c.operation, c.file_operation)).collect();
        assert_eq!(
            ops,
            vec![
                (DeviceOperation::Remove, Some(FileOperation::Destroy)),
                (DeviceOperation::Add, Some(FileOperation::Create)),
            ]
        );
        assert_eq!(rec.changes[1].device.unit_number(), Some(0));

        // Same file declared again: nothing to do.
        let same = declared(
            vec![DiskSpec {
                path: Some("web-1/web-1.vmdk".into()),
                ..sized(20)
            }],
            vec![],
        );
        let rec = reconcile(&existing, None, same.devices(), "datastore-1", &backings()).unwrap();
        assert!(rec.changes.is_empty());
    }

    #[test]
    fn switching_an_attached_slot_to_a_created_disk_detaches_first() {
        let existing = vec![
            pvscsi(1000, 0),
            disk(2000, 1000, 0, 20),
            file(2001, 1000, 1, 10, "shared/data.vmdk"),
        ];
        let previous = declared(vec![sized(20), attached("shared/data.vmdk")], vec![]);
        let desired = declared(vec![sized(20), sized(10)], vec![]);

        let rec = reconcile(&existing, Some(previous.devices()), desired.devices(), "datastore-1", &backings())
            .unwrap();

        let ops: Vec<_> = rec
            .changes
            .iter()
            .map(|c| (c.operation, c.file_operation, c.device.key()))
            .collect();
        assert_eq!(ops[0], (DeviceOperation::Remove, None, 2001));
        assert_eq!(ops[1].0, DeviceOperation::Add);
        assert_eq!(ops[1].1, Some(FileOperation::Create));
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn unresolvable_backings_are_rejected() {
        let existing = vec![pvscsi(1000, 0)];
        let desired = declared(
            vec![DiskSpec {
                datastore_id: Some("datastore-9".into()),
                ..sized(10)
            }],
            vec![],
        );
        let err = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let desired = declared(vec![], vec![on("network-9")]);
        let err = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn new_disk_paths_request_directories() {
        let existing = vec![pvscsi(1000, 0)];
        let desired = declared(
            vec![DiskSpec {
                path: Some("vms/web-1/data.vmdk".into()),
                create_directories: true,
                ..sized(10)
            }],
            vec![],
        );

        let rec = reconcile(&existing, None, desired.devices(), "datastore-1", &backings()).unwrap();
        assert_eq!(
            rec.directories,
            vec![DirectoryRequest {
                datastore: "datastore-1".into(),
                path: "vms/web-1".into(),
            }]
        );
    }
}

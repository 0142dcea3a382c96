use vim_api::{DeviceChange, VirtualDevice, VirtualEthernetCard};

use super::{BackingIndex, Workspace};
use crate::Result;
use crate::types::NetworkInterfaceSpec;

fn same_mac(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Pair declared NICs with attached ones: first by static MAC, then the
/// leftovers in declaration order against device-key order.
pub(super) fn reconcile(
    ws: &mut Workspace,
    desired: &[NetworkInterfaceSpec],
    backings: &BackingIndex,
) -> Result<Vec<DeviceChange>> {
    for (i, nic) in desired.iter().enumerate() {
        backings.check_network(&nic.network_id, &format!("network_interface {i}"))?;
    }

    let mut observed: Vec<VirtualEthernetCard> = ws
        .devices()
        .iter()
        .filter_map(|d| match d {
            VirtualDevice::NetworkInterface(n) => Some(n.clone()),
            _ => None,
        })
        .collect();
    observed.sort_by_key(|n| n.key);

    let mut pairs: Vec<Option<usize>> = vec![None; desired.len()];
    let mut claimed = vec![false; observed.len()];

    for (i, nic) in desired.iter().enumerate() {
        let Some(mac) = &nic.mac_address else { continue };
        let found = observed.iter().enumerate().find(|(j, o)| {
            !claimed[*j] && o.mac_address.as_deref().is_some_and(|m| same_mac(m, mac))
        });
        if let Some((j, _)) = found {
            pairs[i] = Some(j);
            claimed[j] = true;
        }
    }
    for pair in pairs.iter_mut().filter(|p| p.is_none()) {
        if let Some(j) = claimed.iter().position(|c| !c) {
            *pair = Some(j);
            claimed[j] = true;
        }
    }

    let mut changes = Vec::new();

    for (j, nic) in observed.iter().enumerate() {
        if !claimed[j] {
            changes.push(DeviceChange::remove(VirtualDevice::NetworkInterface(nic.clone())));
        }
    }

    for (spec, pair) in desired.iter().zip(&pairs) {
        match pair.map(|j| &observed[j]) {
            Some(current) if current.adapter_type != spec.adapter_type => {
                // Adapter type cannot be edited in place.
                changes.push(DeviceChange::remove(VirtualDevice::NetworkInterface(current.clone())));
                changes.push(DeviceChange::add(VirtualDevice::NetworkInterface(VirtualEthernetCard {
                    key: ws.next_key(),
                    adapter_type: spec.adapter_type,
                    network: spec.network_id.clone(),
                    mac_address: spec.mac_address.clone(),
                    manual_mac: spec.mac_address.is_some(),
                })));
            }
            Some(current) => {
                let mac_differs = match (&spec.mac_address, &current.mac_address) {
                    (Some(want), Some(have)) => !same_mac(want, have),
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if current.network != spec.network_id || mac_differs {
                    let mut edited = current.clone();
                    edited.network = spec.network_id.clone();
                    if mac_differs {
                        edited.mac_address = spec.mac_address.clone();
                        edited.manual_mac = true;
                    }
                    changes.push(DeviceChange::edit(VirtualDevice::NetworkInterface(edited)));
                }
            }
            None => {
                changes.push(DeviceChange::add(VirtualDevice::NetworkInterface(VirtualEthernetCard {
                    key: ws.next_key(),
                    adapter_type: spec.adapter_type,
                    network: spec.network_id.clone(),
                    mac_address: spec.mac_address.clone(),
                    manual_mac: spec.mac_address.is_some(),
                })));
            }
        }
    }

    for change in &changes {
        ws.apply(change);
    }
    Ok(changes)
}

//! Guest customization: building the customization request and watching
//! the VM's event stream until the guest reports the outcome.

use std::net::IpAddr;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vim_api::{
    AdapterMapping, CustomizationIdentity, CustomizationSpec, EventKind, GuestOsFamily,
    IpAssignment, ManagedObjectRef,
};

use crate::net::in_subnet;
use crate::types::{CustomizeSettings, VirtualMachineSpec};
use crate::{Error, EventStream, Inventory, Result};

/// Build the customization request for a VM whose guest belongs to `family`.
pub fn customization_spec(
    settings: &CustomizeSettings,
    desired: &VirtualMachineSpec,
    family: GuestOsFamily,
) -> Result<CustomizationSpec> {
    let short_name = desired.name.split('.').next().unwrap_or(&desired.name).to_string();

    let identity = match family {
        GuestOsFamily::Linux => {
            let linux = settings.linux.clone().unwrap_or_default();
            if linux.domain.is_empty() {
                return Err(Error::Validation("customize: linux domain must be set".into()));
            }
            CustomizationIdentity::LinuxPrep {
                host_name: linux.host_name.unwrap_or(short_name),
                domain: linux.domain,
                time_zone: linux.time_zone,
                hw_clock_utc: linux.hw_clock_utc,
            }
        }
        GuestOsFamily::Windows => {
            let Some(windows) = settings.windows.clone() else {
                return Err(Error::Validation(format!(
                    "customize: guest {} is windows, windows options must be set",
                    desired.guest_id
                )));
            };
            CustomizationIdentity::Sysprep {
                computer_name: windows.computer_name.unwrap_or(short_name),
                full_name: windows.full_name,
                organization_name: windows.organization_name,
                admin_password: windows.admin_password,
                time_zone: windows.time_zone,
                product_key: windows.product_key,
                join_domain: windows.join_domain,
                domain_admin_user: windows.domain_admin_user,
                domain_admin_password: windows.domain_admin_password,
                auto_logon: windows.auto_logon,
                auto_logon_count: windows.auto_logon_count,
            }
        }
        GuestOsFamily::Other => {
            return Err(Error::Validation(format!(
                "customize: guest {} does not support customization",
                desired.guest_id
            )));
        }
    };

    if settings.network_interfaces.len() > desired.network_interfaces.len() {
        return Err(Error::Validation(format!(
            "customize: {} interface settings for {} network interfaces",
            settings.network_interfaces.len(),
            desired.network_interfaces.len()
        )));
    }

    let gateway = |addr: Option<&str>, prefix: u8, gw: Option<&str>| -> Option<String> {
        let ip: IpAddr = addr?.parse().ok()?;
        let gw_str = gw?;
        let gw_ip: IpAddr = gw_str.parse().ok()?;
        in_subnet(gw_ip, ip, prefix).then(|| gw_str.to_string())
    };

    let nic_settings = desired
        .network_interfaces
        .iter()
        .enumerate()
        .map(|(i, nic)| {
            let iface = settings.network_interfaces.get(i).cloned().unwrap_or_default();
            let ipv4 = match &iface.ipv4_address {
                Some(address) => IpAssignment::Fixed {
                    address: address.clone(),
                    prefix_length: iface.ipv4_prefix_length,
                },
                None => IpAssignment::Dhcp,
            };
            let ipv6 = iface.ipv6_address.as_ref().map(|address| IpAssignment::Fixed {
                address: address.clone(),
                prefix_length: iface.ipv6_prefix_length,
            });
            let gateways = [
                gateway(
                    iface.ipv4_address.as_deref(),
                    iface.ipv4_prefix_length,
                    settings.ipv4_gateway.as_deref(),
                ),
                gateway(
                    iface.ipv6_address.as_deref(),
                    iface.ipv6_prefix_length,
                    settings.ipv6_gateway.as_deref(),
                ),
            ]
            .into_iter()
            .flatten()
            .collect();

            AdapterMapping {
                mac_address: nic.mac_address.clone(),
                ipv4,
                ipv6,
                gateways,
            }
        })
        .collect();

    Ok(CustomizationSpec {
        identity,
        dns_servers: settings.dns_servers.clone(),
        dns_suffixes: settings.dns_suffixes.clone(),
        nic_settings,
    })
}

/// How a customization run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomizationOutcome {
    Succeeded,
    Failed(String),
    TimedOut(Duration),
    /// The event stream errored or closed before a terminal event.
    StreamClosed(String),
}

/// Watches a VM's event stream for the end of guest customization.
///
/// The subscription is opened by [`CustomizationWaiter::start`], which must
/// run before the customization request is submitted so no event is
/// missed. The outcome is resolved exactly once. Dropping the waiter stops
/// the reader and closes the subscription.
pub struct CustomizationWaiter {
    outcome: watch::Receiver<Option<CustomizationOutcome>>,
    reader: JoinHandle<()>,
}

impl CustomizationWaiter {
    pub async fn start(inventory: &dyn Inventory, vm: &ManagedObjectRef, timeout: Duration) -> Result<Self> {
        let events = inventory.subscribe_events(vm, EventKind::CUSTOMIZATION).await?;
        let (tx, rx) = watch::channel(None);
        let vm_id = vm.value.clone();

        let reader = tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, next_outcome(events))
                .await
                .unwrap_or(CustomizationOutcome::TimedOut(timeout));
            match &outcome {
                CustomizationOutcome::Succeeded => info!(vm = %vm_id, "guest customization succeeded"),
                other => warn!(vm = %vm_id, outcome = ?other, "guest customization did not succeed"),
            }
            tx.send_replace(Some(outcome));
        });

        debug!(vm = %vm.value, ?timeout, "watching for guest customization");
        Ok(Self { outcome: rx, reader })
    }

    /// Resolves once the outcome is known.
    pub async fn done(&self) {
        let mut rx = self.outcome.clone();
        // A closed channel means the reader is gone; `err` reports that.
        let _ = rx.wait_for(Option::is_some).await;
    }

    /// The outcome as an error, `None` on success or while still pending.
    pub fn err(&self) -> Option<Error> {
        match &*self.outcome.borrow() {
            None if self.reader.is_finished() => Some(Error::CustomizationFailed(
                "event reader stopped without an outcome".into(),
            )),
            None | Some(CustomizationOutcome::Succeeded) => None,
            Some(CustomizationOutcome::Failed(detail)) => Some(Error::CustomizationFailed(detail.clone())),
            Some(CustomizationOutcome::TimedOut(timeout)) => Some(Error::Timeout {
                operation: "guest customization",
                timeout: *timeout,
            }),
            Some(CustomizationOutcome::StreamClosed(reason)) => Some(Error::CustomizationFailed(
                format!("event subscription closed: {reason}"),
            )),
        }
    }

    pub fn outcome(&self) -> Option<CustomizationOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the outcome and turn it into a result.
    pub async fn wait(self) -> Result<()> {
        self.done().await;
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for CustomizationWaiter {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn next_outcome(mut events: EventStream) -> CustomizationOutcome {
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => return CustomizationOutcome::StreamClosed(e.to_string()),
        };
        match event.kind {
            EventKind::CustomizationSucceeded => return CustomizationOutcome::Succeeded,
            kind if kind.is_customization_failure() => {
                let mut detail = format!("{kind:?}: {}", event.full_formatted_message);
                if let Some(log) = &event.log_location {
                    detail.push_str(&format!(" (guest log: {log})"));
                }
                return CustomizationOutcome::Failed(detail);
            }
            kind => debug!(?kind, "customization event"),
        }
    }
    CustomizationOutcome::StreamClosed("stream ended".into())
}

use std::net::IpAddr;

use tracing::{debug, info, warn};
use vim_api::{ManagedObjectRef, PowerState, TaskRequest, ToolsRunningStatus};

use crate::net::routable_address;
use crate::workflow::minutes;
use crate::{Error, Result, VmLifecycle};

impl VmLifecycle {
    pub(crate) async fn power_on(&self, vm: &ManagedObjectRef) -> Result<()> {
        self.run_task(TaskRequest::PowerOnVm { vm: vm.value.clone() }).await?;
        info!(vm = %vm.value, "power: on");
        Ok(())
    }

    pub(crate) async fn power_off(&self, vm: &ManagedObjectRef) -> Result<()> {
        self.run_task(TaskRequest::PowerOffVm { vm: vm.value.clone() }).await?;
        info!(vm = %vm.value, "power: off");
        Ok(())
    }

    /// Shut the guest down, then fall back to a hard power-off when `force`
    /// is set. The shutdown wait is at least one minute.
    pub(crate) async fn graceful_power_off(
        &self,
        vm: &ManagedObjectRef,
        timeout_minutes: i64,
        force: bool,
    ) -> Result<()> {
        let props = self.inventory.properties(vm).await?;
        if props.runtime.power_state == PowerState::PoweredOff {
            return Ok(());
        }

        let tools_running = props
            .guest
            .as_ref()
            .is_some_and(|g| g.tools_running_status == ToolsRunningStatus::GuestToolsRunning);
        if props.runtime.power_state != PowerState::PoweredOn || !tools_running {
            debug!(vm = %vm.value, state = ?props.runtime.power_state, "power: no guest tools, powering off");
            return self.power_off(vm).await;
        }

        let timeout = minutes(timeout_minutes.max(1));
        self.inventory.shutdown_guest(vm).await?;
        info!(vm = %vm.value, ?timeout, "power: waiting for guest shutdown");

        match tokio::time::timeout(timeout, self.poll_powered_off(vm)).await {
            Ok(result) => result,
            Err(_) if force => {
                warn!(vm = %vm.value, ?timeout, "power: guest shutdown timed out, forcing power off");
                self.power_off(vm).await
            }
            Err(_) => Err(Error::Timeout {
                operation: "guest shutdown",
                timeout,
            }),
        }
    }

    async fn poll_powered_off(&self, vm: &ManagedObjectRef) -> Result<()> {
        loop {
            let props = self.inventory.properties(vm).await?;
            if props.runtime.power_state == PowerState::PoweredOff {
                return Ok(());
            }
            tokio::time::sleep(self.config.guest_poll_interval).await;
        }
    }

    /// Wait until the guest reports an address routable through its default
    /// gateway. A non-positive timeout skips the wait without polling.
    pub async fn wait_for_guest_net(&self, vm: &ManagedObjectRef, timeout_minutes: i64) -> Result<Option<IpAddr>> {
        if timeout_minutes <= 0 {
            debug!(vm = %vm.value, "guest net: wait disabled");
            return Ok(None);
        }

        let timeout = minutes(timeout_minutes);
        let ip = tokio::time::timeout(timeout, self.poll_guest_net(vm))
            .await
            .map_err(|_| Error::Timeout {
                operation: "a routable guest interface",
                timeout,
            })??;
        info!(vm = %vm.value, %ip, "guest net: ready");
        Ok(Some(ip))
    }

    async fn poll_guest_net(&self, vm: &ManagedObjectRef) -> Result<IpAddr> {
        loop {
            let props = self.inventory.properties(vm).await?;
            if let Some(ip) = routable_address(props.guest.as_ref()) {
                return Ok(ip);
            }
            tokio::time::sleep(self.config.guest_poll_interval).await;
        }
    }
}

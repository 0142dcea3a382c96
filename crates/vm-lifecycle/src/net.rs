use std::net::IpAddr;

use vim_api::GuestInfo;

/// Whether `ip` falls inside `network/prefix`. Mixed families never match.
pub(crate) fn in_subnet(ip: IpAddr, network: IpAddr, prefix: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let prefix = u32::from(prefix.min(32));
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let prefix = u32::from(prefix.min(128));
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(ip) & mask == u128::from(net) & mask
        }
        _ => false,
    }
}

/// First guest address that shares a subnet with a default gateway, on
/// either IP stack.
pub(crate) fn routable_address(guest: Option<&GuestInfo>) -> Option<IpAddr> {
    let guest = guest?;
    let gateways: Vec<IpAddr> = guest
        .ip_routes
        .iter()
        .filter(|r| r.prefix_length == 0)
        .filter(|r| matches!(r.network.as_str(), "0.0.0.0" | "::"))
        .filter_map(|r| r.gateway.as_deref()?.parse().ok())
        .collect();

    guest
        .net
        .iter()
        .flat_map(|nic| &nic.ip_addresses)
        .filter_map(|addr| Some((addr.address.parse::<IpAddr>().ok()?, addr.prefix_length)))
        .find(|(ip, prefix)| gateways.iter().any(|gw| in_subnet(*gw, *ip, *prefix)))
        .map(|(ip, _)| ip)
}

//! Best-effort UPnP IGD port mapping (§4.8).
//!
//! Grounded on the original implementation's `try_upnp_port_forwarding`:
//! discover the local gateway, then ask it to forward `listen_port` to us.
//! Every failure mode (no IGD on the LAN, discovery timeout, mapping
//! rejected) is logged at `warn` and swallowed; inbound connectivity is a
//! nice-to-have, not a requirement, since the engine can still complete a
//! download purely as a dialing client (§7.6).

use std::time::Duration;

/// How long a lease to request from the gateway before it needs renewing.
/// This engine never renews it: it's requested once at startup and left to
/// expire, matching the original's single `addportmapping` call with no
/// upkeep thread.
const LEASE_DURATION: Duration = Duration::from_secs(2 * 60 * 60);

#[cfg(feature = "upnp")]
type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(feature = "upnp")]
pub async fn map_port(port: u16) {
    let result = tokio::task::spawn_blocking(move || map_port_blocking(port)).await;
    match result {
        Ok(Ok(())) => log::info!("UPnP port {} forwarded successfully", port),
        Ok(Err(e)) => log::warn!("UPnP port forwarding failed: {}", e),
        Err(e) => log::warn!("UPnP task panicked: {}", e),
    }
}

#[cfg(feature = "upnp")]
fn map_port_blocking(port: u16) -> Result<(), BoxError> {
    let gateway = igd::search_gateway(igd::SearchOptions {
        timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    })?;
    let local_addr = local_ipv4_addr()?;
    gateway.add_port(
        igd::PortMappingProtocol::TCP,
        port,
        std::net::SocketAddrV4::new(local_addr, port),
        LEASE_DURATION.as_secs() as u32,
        "peerswarm",
    )?;
    Ok(())
}

#[cfg(feature = "upnp")]
fn local_ipv4_addr() -> Result<std::net::Ipv4Addr, BoxError> {
    use std::net::{IpAddr, SocketAddr, UdpSocket};
    // connecting a UDP socket doesn't send any packets, it just picks the
    // local interface the kernel would route through; a cheap way to learn
    // our own LAN address without enumerating interfaces by hand.
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)), 80))?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(addr) => Ok(addr),
        IpAddr::V6(_) => Err("no local IPv4 address".into()),
    }
}

#[cfg(not(feature = "upnp"))]
pub async fn map_port(_port: u16) {
    log::debug!("UPnP support not compiled in, skipping port mapping");
}

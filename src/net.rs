//! Socket helpers: ephemeral one-shot listeners and local address discovery.
use std::net::{IpAddr, Ipv4Addr};

use anyhow::{Context, Result};
use tokio::net::TcpListener;

/// Bind a listener on an OS-assigned port and report the port back.
/// The listener is returned still bound so there is no window where another
/// process can grab the port (binding port 0 and re-binding later races).
pub async fn bind_ephemeral(host: IpAddr) -> Result<(TcpListener, u16)> {
    let listener = TcpListener::bind((host, 0))
        .await
        .with_context(|| format!("bind ephemeral listener on {host}"))?;
    let port = listener.local_addr().context("ephemeral local_addr")?.port();
    Ok((listener, port))
}

/// Primary non-loopback IPv4 of this machine, or 0.0.0.0 when none is up.
pub fn primary_ipv4() -> IpAddr {
    if let Ok(ifaces) = get_if_addrs::get_if_addrs() {
        for iface in ifaces {
            if iface.is_loopback() {
                continue;
            }
            if let IpAddr::V4(v4) = iface.ip() {
                return IpAddr::V4(v4);
            }
        }
    }
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

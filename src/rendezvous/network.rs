//! Host and port resolution for the rank-0 master endpoint.

use std::net::{TcpListener, UdpSocket};

use super::bootstrap::BootstrapError;

/// Environment override for the node's IPv4 address.
pub const ENV_HOST_IP: &str = "MY_HOST_IP";
/// Environment override for the node's IPv6 address.
pub const ENV_HOST_IPV6: &str = "MY_HOST_IPV6";

/// Resolve this node's reachable address.
///
/// `MY_HOST_IP` wins, then `MY_HOST_IPV6`, then the address the OS routing
/// table picks for outbound traffic (discovered by "connecting" a UDP socket;
/// no packet is sent).
pub fn resolve_host() -> Result<String, BootstrapError> {
    if let Ok(ip) = std::env::var(ENV_HOST_IP) {
        if !ip.is_empty() {
            return Ok(ip);
        }
    }
    if let Ok(ip) = std::env::var(ENV_HOST_IPV6) {
        if !ip.is_empty() {
            return Ok(ip);
        }
    }
    node_ip_by_route()
}

/// Ask the OS which local address routes to the public internet.
fn node_ip_by_route() -> Result<String, BootstrapError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(BootstrapError::Network)?;
    socket
        .connect("8.8.8.8:80")
        .map_err(BootstrapError::Network)?;
    let addr = socket.local_addr().map_err(BootstrapError::Network)?;
    Ok(addr.ip().to_string())
}

/// Ask the OS for a free ephemeral port.
///
/// Binds a transient listener to port 0, reads back the assigned port, and
/// releases the socket. Another process could claim the port between release
/// and actual use; that race is accepted and deliberately not retried, so a
/// downstream bind failure points at the real collision instead of being
/// masked here.
pub fn free_port() -> Result<u16, BootstrapError> {
    let listener = TcpListener::bind(("0.0.0.0", 0)).map_err(BootstrapError::Network)?;
    let port = listener.local_addr().map_err(BootstrapError::Network)?.port();
    Ok(port)
}

/// Resolve the `(host, port)` pair rank 0 publishes as the master endpoint.
pub fn resolve_network_address() -> Result<(String, u16), BootstrapError> {
    Ok((resolve_host()?, free_port()?))
}

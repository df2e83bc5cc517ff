//! Endpoint address validation and socket formatting.

use drover_platform::{DroverError, DroverResult};
use std::net::IpAddr;

/// Validates an endpoint address and port and formats the dial socket.
///
/// Ports outside `1..=65535` and addresses that do not parse as an IP are
/// rejected. IPv6 addresses are bracketed for the socket string.
///
/// # Example
///
/// ```rust
/// use drover_proto::ssh::parse_endpoint_address;
///
/// assert_eq!(
///     parse_endpoint_address("10.1.0.10", 22).unwrap(),
///     "10.1.0.10:22"
/// );
/// assert_eq!(
///     parse_endpoint_address("fd00::10", 2022).unwrap(),
///     "[fd00::10]:2022"
/// );
/// ```
pub fn parse_endpoint_address(address: &str, port: u32) -> DroverResult<String> {
    if port == 0 || port > 65535 {
        return Err(DroverError::Config(format!(
            "endpoint port number '{}' out of range",
            port
        )));
    }

    let ip: IpAddr = address.parse().map_err(|_| {
        DroverError::Config(format!("endpoint ip '{}' is not valid", address))
    })?;

    let socket = if ip.is_ipv6() {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    };

    Ok(socket)
}

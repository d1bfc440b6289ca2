use std::fmt;

use crate::codec::{ProtocolError, Result};

/// Env var set by the host when launching a channel binary. The channel
/// creates `<dir>/channel.sock`, writes no handshake line, and serves once
/// accepted.
pub const CHANNEL_SOCK_DIR_ENV: &str = "OPENTALON_CHANNEL_SOCK_DIR";
/// Socket file name a channel binary creates under the sock dir.
pub const CHANNEL_SOCK_FILE: &str = "channel.sock";

/// Plugin handshake protocol version. The only one we speak.
pub const PLUGIN_PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketNetwork {
    Unix,
    Tcp,
}

impl SocketNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketNetwork::Unix => "unix",
            SocketNetwork::Tcp => "tcp",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "unix" => Ok(SocketNetwork::Unix),
            "tcp" => Ok(SocketNetwork::Tcp),
            other => Err(ProtocolError::Handshake(format!(
                "unknown network {other:?} (want unix or tcp)"
            ))),
        }
    }
}

impl fmt::Display for SocketNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a subprocess told us to dial it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub network: SocketNetwork,
    /// Socket path for unix, `host:port` for tcp.
    pub address: String,
}

/// Parse a plugin handshake line: `1|unix|<path>` or `1|tcp|<host:port>`.
/// The leading field is the protocol version and must be `1`.
pub fn parse_plugin_handshake(line: &str) -> Result<Handshake> {
    let (version, network, address) = split_handshake(line)?;
    if version != PLUGIN_PROTOCOL_VERSION {
        return Err(ProtocolError::Handshake(format!(
            "unsupported plugin protocol version {version:?}"
        )));
    }
    Ok(Handshake {
        network: SocketNetwork::parse(network)?,
        address: address.to_string(),
    })
}

/// Parse a channel handshake line: `<channel-id>|unix|<path>`. Channels
/// carry their id instead of a version field. Returns `(id, handshake)`.
pub fn parse_channel_handshake(line: &str) -> Result<(String, Handshake)> {
    let (id, network, address) = split_handshake(line)?;
    if id.is_empty() {
        return Err(ProtocolError::Handshake("empty channel id".to_string()));
    }
    Ok((
        id.to_string(),
        Handshake {
            network: SocketNetwork::parse(network)?,
            address: address.to_string(),
        },
    ))
}

fn split_handshake(line: &str) -> Result<(&str, &str, &str)> {
    let line = line.trim();
    let mut parts = line.splitn(3, '|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), Some(c)) if !c.is_empty() => Ok((a, b, c)),
        _ => Err(ProtocolError::Handshake(format!(
            "malformed handshake line {line:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_unix_handshake() {
        let hs = parse_plugin_handshake("1|unix|/tmp/talon/p.sock").unwrap();
        assert_eq!(hs.network, SocketNetwork::Unix);
        assert_eq!(hs.address, "/tmp/talon/p.sock");
    }

    #[test]
    fn plugin_tcp_handshake() {
        let hs = parse_plugin_handshake("1|tcp|127.0.0.1:7421\n").unwrap();
        assert_eq!(hs.network, SocketNetwork::Tcp);
        assert_eq!(hs.address, "127.0.0.1:7421");
    }

    #[test]
    fn plugin_rejects_wrong_version() {
        assert!(parse_plugin_handshake("2|unix|/tmp/x.sock").is_err());
    }

    #[test]
    fn plugin_rejects_unknown_network() {
        assert!(parse_plugin_handshake("1|udp|/tmp/x.sock").is_err());
    }

    #[test]
    fn channel_handshake_carries_id() {
        let (id, hs) = parse_channel_handshake("slack|unix|/tmp/c.sock").unwrap();
        assert_eq!(id, "slack");
        assert_eq!(hs.network, SocketNetwork::Unix);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(parse_plugin_handshake("1|unix").is_err());
        assert!(parse_plugin_handshake("garbage").is_err());
        assert!(parse_channel_handshake("|unix|/tmp/x").is_err());
    }
}

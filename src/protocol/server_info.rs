//! Handshake payloads: connect/discovery requests, server info and echo.

use std::net::Ipv4Addr;

use super::WireFormat;
use super::buffer::{Reader, Writer};
use super::features::Feature;
use crate::Result;
use crate::types::{FullVersion, Version};

/// Width of the fixed name field leading connect, discovery and server info payloads.
pub const NAME_FIELD_LEN: usize = 256;

/// Multicast group servers stream to unless configured otherwise.
pub const DEFAULT_MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

/// Where and how the server streams frame data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// `0` when the server did not say; clients then use the command port plus one.
    pub data_port: u16,
    pub multicast: bool,
    pub multicast_address: Ipv4Addr,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self { data_port: 0, multicast: false, multicast_address: DEFAULT_MULTICAST_ADDRESS }
    }
}

/// Server description returned for connect and discovery requests.
///
/// The layout depends on the server's own stream version, not on any negotiated one: servers
/// below 3.0 stop after the version quads, and the clock and connection fields keep their
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerInfo {
    pub application_name: String,
    pub server_version: FullVersion,
    pub nat_net_version: FullVersion,
    /// Ticks per second of the server's high resolution clock; `0` when unknown.
    pub high_resolution_clock_frequency: u64,
    pub connection_info: ConnectionInfo,
}

impl ServerInfo {
    /// Stream version the server declares.
    pub fn version(&self) -> Version {
        self.nat_net_version.version()
    }

    fn layout_version(&self) -> Version {
        self.version().normalized()
    }
}

impl WireFormat for ServerInfo {
    fn encode(&self, writer: &mut Writer, _version: Version) {
        writer.write_fixed_string(&self.application_name, NAME_FIELD_LEN);
        writer.write_bytes(&self.server_version.to_bytes());
        writer.write_bytes(&self.nat_net_version.to_bytes());
        if self.layout_version().supports(Feature::ServerConnectionInfo) {
            writer.write_u64(self.high_resolution_clock_frequency);
            writer.write_u16(self.connection_info.data_port);
            writer.write_bool(self.connection_info.multicast);
            writer.write_bytes(&self.connection_info.multicast_address.octets());
        }
    }

    fn decode(reader: &mut Reader<'_>, _version: Version) -> Result<Self> {
        let mut info = ServerInfo {
            application_name: reader.read_fixed_string(NAME_FIELD_LEN)?,
            server_version: read_full_version(reader)?,
            nat_net_version: read_full_version(reader)?,
            ..Default::default()
        };
        if info.layout_version().supports(Feature::ServerConnectionInfo) {
            info.high_resolution_clock_frequency = reader.read_u64()?;
            info.connection_info.data_port = reader.read_u16()?;
            info.connection_info.multicast = reader.read_bool()?;
            let octets = reader.read_bytes(4, "multicast address")?;
            info.connection_info.multicast_address =
                Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        }
        Ok(info)
    }
}

fn read_full_version(reader: &mut Reader<'_>) -> Result<FullVersion> {
    let bytes = reader.read_bytes(4, "version")?;
    Ok(FullVersion::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

/// Body of connect and discovery requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientHello {
    pub client_name: String,
    pub app_version: FullVersion,
    /// Highest stream version the client understands.
    pub nat_net_version: FullVersion,
}

impl ClientHello {
    pub fn new(client_name: impl Into<String>, max_version: Version) -> Self {
        Self {
            client_name: client_name.into(),
            app_version: FullVersion::from(max_version),
            nat_net_version: FullVersion::from(max_version),
        }
    }
}

impl WireFormat for ClientHello {
    fn encode(&self, writer: &mut Writer, _version: Version) {
        writer.write_fixed_string(&self.client_name, NAME_FIELD_LEN);
        writer.write_bytes(&self.app_version.to_bytes());
        writer.write_bytes(&self.nat_net_version.to_bytes());
    }

    fn decode(reader: &mut Reader<'_>, _version: Version) -> Result<Self> {
        Ok(Self {
            client_name: reader.read_fixed_string(NAME_FIELD_LEN)?,
            app_version: read_full_version(reader)?,
            nat_net_version: read_full_version(reader)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoRequest {
    /// Client clock at send time, nanoseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoResponse {
    /// The client timestamp being echoed.
    pub request_stamp: u64,
    /// Server tick count when the request arrived.
    pub received_stamp: u64,
}

impl WireFormat for EchoRequest {
    fn encode(&self, writer: &mut Writer, _version: Version) {
        writer.write_u64(self.timestamp);
    }

    fn decode(reader: &mut Reader<'_>, _version: Version) -> Result<Self> {
        Ok(Self { timestamp: reader.read_u64()? })
    }
}

impl WireFormat for EchoResponse {
    fn encode(&self, writer: &mut Writer, _version: Version) {
        writer.write_u64(self.request_stamp);
        writer.write_u64(self.received_stamp);
    }

    fn decode(reader: &mut Reader<'_>, _version: Version) -> Result<Self> {
        Ok(Self { request_stamp: reader.read_u64()?, received_stamp: reader.read_u64()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(version: FullVersion) -> ServerInfo {
        ServerInfo {
            application_name: "Motive".into(),
            server_version: FullVersion::new(3, 1, 0, 0),
            nat_net_version: version,
            high_resolution_clock_frequency: 1_000_000_000,
            connection_info: ConnectionInfo {
                data_port: 1511,
                multicast: true,
                multicast_address: Ipv4Addr::new(239, 255, 42, 100),
            },
        }
    }

    #[test]
    fn server_info_layout_follows_declared_version() {
        for (declared, len) in [(FullVersion::new(3, 1, 0, 0), 256 + 8 + 8 + 2 + 1 + 4), (FullVersion::new(2, 9, 0, 0), 256 + 8)] {
            let mut writer = Writer::new();
            info(declared).encode(&mut writer, Version::new(2, 0));
            let bytes = writer.into_inner();
            assert_eq!(bytes.len(), len);
            // negotiated version is irrelevant to this payload
            let decoded = ServerInfo::decode(&mut Reader::new(&bytes), Version::LATEST).expect("decode");
            assert_eq!(decoded.nat_net_version, declared);
            assert_eq!(decoded.application_name, "Motive");
        }
    }

    #[test]
    fn pre_3_server_info_defaults_connection_fields() {
        let mut writer = Writer::new();
        info(FullVersion::new(2, 9, 0, 0)).encode(&mut writer, Version::LATEST);
        let bytes = writer.into_inner();
        let decoded = ServerInfo::decode(&mut Reader::new(&bytes), Version::LATEST).expect("decode");
        assert_eq!(decoded.high_resolution_clock_frequency, 0);
        assert_eq!(decoded.connection_info, ConnectionInfo::default());
    }

    #[test]
    fn hello_is_fixed_width() {
        let mut writer = Writer::new();
        ClientHello::new("natnet-rs", Version::LATEST).encode(&mut writer, Version::LATEST);
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), NAME_FIELD_LEN + 8);
        assert_eq!(&bytes[NAME_FIELD_LEN..NAME_FIELD_LEN + 2], &[4, 1]);
    }
}

//! Lifecycle states and the per-session snapshot shared with the streaming side.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::protocol::description::{AssetIds, MoCapDescription};
use crate::protocol::features::Feature;
use crate::protocol::server_info::ServerInfo;
use crate::types::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Discovering,
    Connecting,
    Connected,
    /// Connected with a server-side subscription filter in place.
    Subscribed,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Where frame data arrives for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEndpoint {
    pub port: u16,
    /// `Some(group)` when joining a multicast group instead of binding a unicast port.
    pub multicast_group: Option<Ipv4Addr>,
}

impl DataEndpoint {
    pub fn is_multicast(&self) -> bool {
        self.multicast_group.is_some()
    }
}

/// Everything known about the connected server, replaced as a whole on every change.
///
/// Readers take an `Arc<Session>` out of the connection's watch channel, so they either see the
/// previous snapshot or the next one, never a mix of both.
#[derive(Debug, Clone)]
pub struct Session {
    pub server_address: SocketAddr,
    pub server_info: ServerInfo,
    /// Negotiated stream version.
    pub version: Version,
    pub data: DataEndpoint,
    /// `None` until the first description exchange completes.
    pub description: Option<Arc<MoCapDescription>>,
    pub asset_ids: Arc<AssetIds>,
}

impl Session {
    pub fn new(
        server_address: SocketAddr,
        server_info: ServerInfo,
        version: Version,
        data: DataEndpoint,
    ) -> Self {
        Self {
            server_address,
            server_info,
            version,
            data,
            description: None,
            asset_ids: Arc::new(AssetIds::default()),
        }
    }

    pub fn with_description(&self, description: MoCapDescription) -> Self {
        let asset_ids = Arc::new(description.asset_ids());
        Self { description: Some(Arc::new(description)), asset_ids, ..self.clone() }
    }

    pub fn with_server_info(&self, server_info: ServerInfo, version: Version) -> Self {
        Self { server_info, version, ..self.clone() }
    }

    pub fn uses_multicast(&self) -> bool {
        self.data.is_multicast()
    }

    /// Subscription filters need a 4.x stream delivered over unicast.
    pub fn can_subscribe(&self) -> bool {
        self.version.supports(Feature::Subscriptions) && !self.uses_multicast()
    }

    pub fn can_change_bitstream_version(&self) -> bool {
        self.version.supports(Feature::BitstreamChange) && !self.uses_multicast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FullVersion;

    fn session(version: Version, multicast: bool) -> Session {
        let info = ServerInfo {
            nat_net_version: FullVersion::from(version),
            ..Default::default()
        };
        let data = DataEndpoint {
            port: 1511,
            multicast_group: multicast.then_some(Ipv4Addr::new(239, 255, 42, 99)),
        };
        Session::new(SocketAddr::from(([127, 0, 0, 1], 1510)), info, version, data)
    }

    #[test]
    fn capabilities_need_4_0_and_unicast() {
        assert!(session(Version::new(4, 0), false).can_subscribe());
        assert!(session(Version::new(4, 1), false).can_change_bitstream_version());
        assert!(!session(Version::new(4, 1), true).can_subscribe());
        assert!(!session(Version::new(3, 1), false).can_subscribe());
        assert!(!session(Version::new(3, 1), false).can_change_bitstream_version());
    }

    #[test]
    fn description_replacement_refreshes_ids() {
        use crate::protocol::description::RigidBodyDescription;

        let base = session(Version::new(3, 1), false);
        assert!(base.asset_ids.rigid_bodies.is_empty());
        let described = base.with_description(MoCapDescription {
            rigid_bodies: vec![RigidBodyDescription { name: "RB0".into(), id: 1, ..Default::default() }],
            ..Default::default()
        });
        assert!(described.asset_ids.rigid_bodies.contains(&1));
        assert!(base.description.is_none());
    }
}

//! Protocol versions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::protocol::features::Feature;
use crate::{NatNetError, Result};

/// Negotiated stream version, totally ordered by `(major, minor)`.
///
/// A server that declares major version `0` streams the newest layout it knows; use
/// [`Version::normalized`] before comparing against feature thresholds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    /// Newest layout this crate encodes and decodes.
    pub const LATEST: Version = Version::new(4, 1);

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Maps the "unspecified" major version `0` onto [`Version::LATEST`].
    pub fn normalized(self) -> Self {
        if self.major == 0 { Self::LATEST } else { self }
    }

    /// Whether the given versioned field or record exists in this version's layout.
    pub fn supports(self, feature: Feature) -> bool {
        feature.is_available(self)
    }

    /// Version used for a session: the lower of what the client and the server support.
    pub fn negotiate(client_max: Version, server: Version) -> Version {
        client_max.normalized().min(server.normalized())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = NatNetError;

    fn from_str(s: &str) -> Result<Self> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| NatNetError::malformed("version", format!("expected M.m, got {s:?}")))?;
        let parse = |part: &str| {
            part.parse::<u8>()
                .map_err(|e| NatNetError::malformed("version", format!("{part:?}: {e}")))
        };
        Ok(Version::new(parse(major)?, parse(minor)?))
    }
}

impl From<(u8, u8)> for Version {
    fn from((major, minor): (u8, u8)) -> Self {
        Version::new(major, minor)
    }
}

/// Four-byte version quad as carried in connect, discovery and server info payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FullVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
    pub revision: u8,
}

impl FullVersion {
    pub const fn new(major: u8, minor: u8, build: u8, revision: u8) -> Self {
        Self { major, minor, build, revision }
    }

    pub fn version(&self) -> Version {
        Version::new(self.major, self.minor)
    }

    pub fn to_bytes(self) -> [u8; 4] {
        [self.major, self.minor, self.build, self.revision]
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

impl From<Version> for FullVersion {
    fn from(version: Version) -> Self {
        FullVersion::new(version.major, version.minor, 0, 0)
    }
}

impl fmt::Display for FullVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn ordering_matches_tuple_ordering(a in any::<(u8, u8)>(), b in any::<(u8, u8)>()) {
            prop_assert_eq!(Version::from(a).cmp(&Version::from(b)), a.cmp(&b));
        }

        #[test]
        fn negotiation_never_exceeds_either_side(client in (1u8..6, any::<u8>()), server in (1u8..6, any::<u8>())) {
            let client = Version::from(client);
            let server = Version::from(server);
            let negotiated = Version::negotiate(client, server);
            prop_assert!(negotiated <= client);
            prop_assert!(negotiated <= server);
            prop_assert!(negotiated == client || negotiated == server);
        }
    }

    #[test]
    fn major_zero_means_latest() {
        assert_eq!(Version::new(0, 0).normalized(), Version::LATEST);
        assert_eq!(Version::negotiate(Version::LATEST, Version::new(0, 0)), Version::LATEST);
        assert_eq!(Version::negotiate(Version::new(3, 0), Version::new(0, 0)), Version::new(3, 0));
    }

    #[test]
    fn parses_dotted_form() {
        assert_eq!("3.1".parse::<Version>().expect("parse"), Version::new(3, 1));
        assert!("3".parse::<Version>().is_err());
        assert!("3.x".parse::<Version>().is_err());
        assert_eq!(Version::new(2, 11).to_string(), "2.11");
    }

    #[test]
    fn full_version_quad() {
        let quad = FullVersion::new(4, 1, 2, 3);
        assert_eq!(FullVersion::from_bytes(quad.to_bytes()), quad);
        assert_eq!(quad.version(), Version::new(4, 1));
        assert_eq!(FullVersion::from(Version::new(3, 1)).to_string(), "3.1.0.0");
    }
}

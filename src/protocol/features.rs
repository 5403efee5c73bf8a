//! Version thresholds for every optional field and record in the protocol.
//!
//! Each [`Feature`] names one layout difference together with the version that introduced it
//! (and, for legacy layouts, the version that removed it). Codecs branch only through
//! [`Version::supports`], so the table below is the single place a threshold lives and
//! conformance tests can walk every boundary through [`Feature::ALL`].

use crate::types::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Marker positions embedded in rigid body data records.
    LegacyRigidBodyMarkers,
    /// Marker ids and sizes following the embedded marker positions.
    LegacyRigidBodyMarkerDetails,
    /// Mean marker error on rigid body data records.
    RigidBodyError,
    /// Rigid body parameter bits (tracking valid).
    RigidBodyParams,
    /// Skeleton list in frame data.
    Skeletons,
    /// Labeled marker list in frame data.
    LabeledMarkers,
    /// Labeled marker parameter bits.
    LabeledMarkerParams,
    /// Labeled marker residual.
    LabeledMarkerResidual,
    /// Force plate list in frame data.
    ForcePlates,
    /// Device list in frame data.
    Devices,
    /// Suffix timestamp widened from `f32` to `f64`.
    DoubleTimestamp,
    /// Camera mid-exposure, data received and transmit tick stamps in the suffix.
    HighResolutionStamps,
    /// Rigid body description name.
    RigidBodyDescriptionName,
    /// Marker offsets and active labels in rigid body descriptions.
    RigidBodyDescriptionMarkers,
    /// Marker names in rigid body descriptions.
    RigidBodyDescriptionMarkerNames,
    /// Force plate description records.
    ForcePlateDescriptions,
    /// Device description records.
    DeviceDescriptions,
    /// Camera description records.
    CameraDescriptions,
    /// Clock frequency and connection info in server info payloads.
    ServerConnectionInfo,
    /// `SubscribeToData` / `SubscribeByID` commands.
    Subscriptions,
    /// `Bitstream,M.m` command.
    BitstreamChange,
    /// `EnableAsset` / `DisableAsset` commands.
    AssetEnable,
}

impl Feature {
    pub const ALL: &'static [Feature] = &[
        Feature::LegacyRigidBodyMarkers,
        Feature::LegacyRigidBodyMarkerDetails,
        Feature::RigidBodyError,
        Feature::RigidBodyParams,
        Feature::Skeletons,
        Feature::LabeledMarkers,
        Feature::LabeledMarkerParams,
        Feature::LabeledMarkerResidual,
        Feature::ForcePlates,
        Feature::Devices,
        Feature::DoubleTimestamp,
        Feature::HighResolutionStamps,
        Feature::RigidBodyDescriptionName,
        Feature::RigidBodyDescriptionMarkers,
        Feature::RigidBodyDescriptionMarkerNames,
        Feature::ForcePlateDescriptions,
        Feature::DeviceDescriptions,
        Feature::CameraDescriptions,
        Feature::ServerConnectionInfo,
        Feature::Subscriptions,
        Feature::BitstreamChange,
        Feature::AssetEnable,
    ];

    pub const fn introduced_in(self) -> Version {
        match self {
            Feature::LegacyRigidBodyMarkers => Version::new(1, 0),
            Feature::LegacyRigidBodyMarkerDetails => Version::new(2, 0),
            Feature::RigidBodyError => Version::new(2, 0),
            Feature::RigidBodyParams => Version::new(2, 6),
            Feature::Skeletons => Version::new(2, 1),
            Feature::LabeledMarkers => Version::new(2, 4),
            Feature::LabeledMarkerParams => Version::new(2, 6),
            Feature::LabeledMarkerResidual => Version::new(3, 0),
            Feature::ForcePlates => Version::new(2, 9),
            Feature::Devices => Version::new(2, 11),
            Feature::DoubleTimestamp => Version::new(2, 7),
            Feature::HighResolutionStamps => Version::new(3, 0),
            Feature::RigidBodyDescriptionName => Version::new(2, 0),
            Feature::RigidBodyDescriptionMarkers => Version::new(3, 0),
            Feature::RigidBodyDescriptionMarkerNames => Version::new(4, 0),
            Feature::ForcePlateDescriptions => Version::new(3, 0),
            Feature::DeviceDescriptions => Version::new(3, 0),
            Feature::CameraDescriptions => Version::new(4, 0),
            Feature::ServerConnectionInfo => Version::new(3, 0),
            Feature::Subscriptions => Version::new(4, 0),
            Feature::BitstreamChange => Version::new(4, 0),
            Feature::AssetEnable => Version::new(4, 0),
        }
    }

    /// First version whose layout no longer carries this feature.
    pub const fn removed_in(self) -> Option<Version> {
        match self {
            Feature::LegacyRigidBodyMarkers | Feature::LegacyRigidBodyMarkerDetails => {
                Some(Version::new(3, 0))
            }
            _ => None,
        }
    }

    pub fn is_available(self, version: Version) -> bool {
        let version = version.normalized();
        version >= self.introduced_in() && self.removed_in().is_none_or(|removed| version < removed)
    }
}

//! Per-frame motion capture data (`FRAMEOFDATA` payload).
//!
//! Layout, in order: frame number, marker sets, unlabeled markers, rigid bodies, skeletons,
//! labeled markers, force plates, devices, the [`FrameSuffix`] trailer and a closing `i32`.
//! Lists that a version does not carry are neither read nor written and decode as empty.

use tracing::trace;

use super::WireFormat;
use super::buffer::{MAX_NAME_LEN, Reader, Writer};
use super::features::Feature;
use crate::Result;
use crate::types::{Quaternion, Vector3, Version};

const RIGID_BODY_MIN_SIZE: usize = 4 + Vector3::WIRE_SIZE + Quaternion::WIRE_SIZE;
const LABELED_MARKER_MIN_SIZE: usize = 4 + Vector3::WIRE_SIZE + 4;

/// Named group of marker positions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarkerSetData {
    pub name: String,
    pub positions: Vec<Vector3>,
}

/// Marker embedded in a legacy rigid body record.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RigidBodyMarker {
    pub position: Vector3,
    pub id: i32,
    pub size: f32,
}

/// Pose of one rigid body in one frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RigidBodyData {
    /// Streaming id; for skeleton bones the skeleton id is in the high 16 bits.
    pub id: i32,
    pub position: Vector3,
    pub orientation: Quaternion,
    /// Only streamed by versions before 3.0; later versions describe markers in the model.
    pub markers: Vec<RigidBodyMarker>,
    /// Mean marker error in meters.
    pub error: f32,
    pub tracking_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SkeletonData {
    pub id: i32,
    pub rigid_bodies: Vec<RigidBodyData>,
}

/// Labeled marker; `params` bit 0 occluded, bit 1 point cloud solved, bit 2 model solved.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LabeledMarker {
    pub id: i32,
    pub position: Vector3,
    pub size: f32,
    pub params: i16,
    pub residual: f32,
}

impl LabeledMarker {
    /// Asset id and member id packed into the marker id.
    pub fn model_and_marker_id(&self) -> (u16, u16) {
        let raw = self.id as u32;
        ((raw >> 16) as u16, (raw & 0xffff) as u16)
    }

    pub fn is_occluded(&self) -> bool {
        self.params & 0x01 != 0
    }

    pub fn is_point_cloud_solved(&self) -> bool {
        self.params & 0x02 != 0
    }

    pub fn is_model_solved(&self) -> bool {
        self.params & 0x04 != 0
    }
}

/// Analog channels sampled by a force plate or external device during one frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnalogData {
    pub id: i32,
    pub channels: Vec<Vec<f32>>,
}

pub type ForcePlateData = AnalogData;
pub type DeviceData = AnalogData;

/// Frame trailer: timing and state flags.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameSuffix {
    pub timecode: u32,
    pub timecode_sub: u32,
    /// Seconds since the server software started.
    pub timestamp: f64,
    /// Server ticks, see [`crate::ServerInfo::high_resolution_clock_frequency`].
    pub stamp_camera_mid_exposure: u64,
    pub stamp_data_received: u64,
    pub stamp_transmit: u64,
    pub is_recording: bool,
    pub tracked_models_changed: bool,
    pub is_editing: bool,
    pub bitstream_version_changed: bool,
}

impl FrameSuffix {
    fn params(&self) -> i16 {
        let mut params = 0i16;
        if self.is_recording {
            params |= 0x01;
        }
        if self.tracked_models_changed {
            params |= 0x02;
        }
        if self.is_editing {
            params |= 0x04;
        }
        if self.bitstream_version_changed {
            params |= 0x08;
        }
        params
    }
}

impl WireFormat for FrameSuffix {
    fn encode(&self, writer: &mut Writer, version: Version) {
        writer.write_u32(self.timecode);
        writer.write_u32(self.timecode_sub);
        if version.supports(Feature::DoubleTimestamp) {
            writer.write_f64(self.timestamp);
        } else {
            writer.write_f32(self.timestamp as f32);
        }
        if version.supports(Feature::HighResolutionStamps) {
            writer.write_u64(self.stamp_camera_mid_exposure);
            writer.write_u64(self.stamp_data_received);
            writer.write_u64(self.stamp_transmit);
        }
        writer.write_i16(self.params());
    }

    fn decode(reader: &mut Reader<'_>, version: Version) -> Result<Self> {
        let mut suffix = FrameSuffix {
            timecode: reader.read_u32()?,
            timecode_sub: reader.read_u32()?,
            ..Default::default()
        };
        suffix.timestamp = if version.supports(Feature::DoubleTimestamp) {
            reader.read_f64()?
        } else {
            f64::from(reader.read_f32()?)
        };
        if version.supports(Feature::HighResolutionStamps) {
            suffix.stamp_camera_mid_exposure = reader.read_u64()?;
            suffix.stamp_data_received = reader.read_u64()?;
            suffix.stamp_transmit = reader.read_u64()?;
        }
        let params = reader.read_i16()?;
        suffix.is_recording = params & 0x01 != 0;
        suffix.tracked_models_changed = params & 0x02 != 0;
        suffix.is_editing = params & 0x04 != 0;
        suffix.bitstream_version_changed = params & 0x08 != 0;
        Ok(suffix)
    }
}

impl WireFormat for RigidBodyData {
    fn encode(&self, writer: &mut Writer, version: Version) {
        writer.write_i32(self.id);
        self.position.write(writer);
        self.orientation.write(writer);
        if version.supports(Feature::LegacyRigidBodyMarkers) {
            writer.write_list(&self.markers, |w, m| m.position.write(w));
            if version.supports(Feature::LegacyRigidBodyMarkerDetails) {
                for marker in &self.markers {
                    writer.write_i32(marker.id);
                }
                for marker in &self.markers {
                    writer.write_f32(marker.size);
                }
            }
        }
        if version.supports(Feature::RigidBodyError) {
            writer.write_f32(self.error);
        }
        if version.supports(Feature::RigidBodyParams) {
            writer.write_i16(i16::from(self.tracking_valid));
        }
    }

    fn decode(reader: &mut Reader<'_>, version: Version) -> Result<Self> {
        let mut body = RigidBodyData {
            id: reader.read_i32()?,
            position: Vector3::read(reader)?,
            orientation: Quaternion::read(reader)?,
            ..Default::default()
        };
        if version.supports(Feature::LegacyRigidBodyMarkers) {
            body.markers = reader.read_list(Vector3::WIRE_SIZE, "rigid body markers", |r| {
                Ok(RigidBodyMarker { position: Vector3::read(r)?, ..Default::default() })
            })?;
            if version.supports(Feature::LegacyRigidBodyMarkerDetails) {
                for marker in &mut body.markers {
                    marker.id = reader.read_i32()?;
                }
                for marker in &mut body.markers {
                    marker.size = reader.read_f32()?;
                }
            }
        }
        if version.supports(Feature::RigidBodyError) {
            body.error = reader.read_f32()?;
        }
        if version.supports(Feature::RigidBodyParams) {
            body.tracking_valid = reader.read_i16()? & 0x01 != 0;
        }
        Ok(body)
    }
}

impl WireFormat for SkeletonData {
    fn encode(&self, writer: &mut Writer, version: Version) {
        writer.write_i32(self.id);
        writer.write_list(&self.rigid_bodies, |w, body| body.encode(w, version));
    }

    fn decode(reader: &mut Reader<'_>, version: Version) -> Result<Self> {
        Ok(SkeletonData {
            id: reader.read_i32()?,
            rigid_bodies: reader.read_list(RIGID_BODY_MIN_SIZE, "skeleton bones", |r| {
                RigidBodyData::decode(r, version)
            })?,
        })
    }
}

impl WireFormat for LabeledMarker {
    fn encode(&self, writer: &mut Writer, version: Version) {
        writer.write_i32(self.id);
        self.position.write(writer);
        writer.write_f32(self.size);
        if version.supports(Feature::LabeledMarkerParams) {
            writer.write_i16(self.params);
        }
        if version.supports(Feature::LabeledMarkerResidual) {
            writer.write_f32(self.residual);
        }
    }

    fn decode(reader: &mut Reader<'_>, version: Version) -> Result<Self> {
        let mut marker = LabeledMarker {
            id: reader.read_i32()?,
            position: Vector3::read(reader)?,
            size: reader.read_f32()?,
            ..Default::default()
        };
        if version.supports(Feature::LabeledMarkerParams) {
            marker.params = reader.read_i16()?;
        }
        if version.supports(Feature::LabeledMarkerResidual) {
            marker.residual = reader.read_f32()?;
        }
        Ok(marker)
    }
}

impl WireFormat for AnalogData {
    fn encode(&self, writer: &mut Writer, _version: Version) {
        writer.write_i32(self.id);
        writer.write_list(&self.channels, |w, channel| {
            w.write_list(channel, |w, value| w.write_f32(*value));
        });
    }

    fn decode(reader: &mut Reader<'_>, _version: Version) -> Result<Self> {
        Ok(AnalogData {
            id: reader.read_i32()?,
            channels: reader.read_list(4, "analog channels", |r| {
                r.read_list(4, "analog samples", |r| r.read_f32())
            })?,
        })
    }
}

/// Everything the server streamed for one frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MoCapData {
    pub frame_number: u32,
    pub marker_sets: Vec<MarkerSetData>,
    pub unlabeled_markers: Vec<Vector3>,
    pub rigid_bodies: Vec<RigidBodyData>,
    pub skeletons: Vec<SkeletonData>,
    pub labeled_markers: Vec<LabeledMarker>,
    pub force_plates: Vec<ForcePlateData>,
    pub devices: Vec<DeviceData>,
    pub suffix: FrameSuffix,
}

impl MoCapData {
    pub fn rigid_body(&self, id: i32) -> Option<&RigidBodyData> {
        self.rigid_bodies.iter().find(|body| body.id == id)
    }
}

impl WireFormat for MoCapData {
    fn encode(&self, writer: &mut Writer, version: Version) {
        writer.write_u32(self.frame_number);
        writer.write_list(&self.marker_sets, |w, set| {
            w.write_cstring(&set.name);
            w.write_list(&set.positions, |w, p| p.write(w));
        });
        writer.write_list(&self.unlabeled_markers, |w, p| p.write(w));
        writer.write_list(&self.rigid_bodies, |w, body| body.encode(w, version));
        if version.supports(Feature::Skeletons) {
            writer.write_list(&self.skeletons, |w, s| s.encode(w, version));
        }
        if version.supports(Feature::LabeledMarkers) {
            writer.write_list(&self.labeled_markers, |w, m| m.encode(w, version));
        }
        if version.supports(Feature::ForcePlates) {
            writer.write_list(&self.force_plates, |w, p| p.encode(w, version));
        }
        if version.supports(Feature::Devices) {
            writer.write_list(&self.devices, |w, d| d.encode(w, version));
        }
        self.suffix.encode(writer, version);
        writer.write_i32(0);
    }

    fn decode(reader: &mut Reader<'_>, version: Version) -> Result<Self> {
        let mut data = MoCapData { frame_number: reader.read_u32()?, ..Default::default() };
        data.marker_sets = reader.read_list(5, "marker sets", |r| {
            Ok(MarkerSetData {
                name: r.read_cstring(MAX_NAME_LEN)?,
                positions: r.read_list(Vector3::WIRE_SIZE, "marker set positions", Vector3::read)?,
            })
        })?;
        data.unlabeled_markers =
            reader.read_list(Vector3::WIRE_SIZE, "unlabeled markers", Vector3::read)?;
        data.rigid_bodies = reader.read_list(RIGID_BODY_MIN_SIZE, "rigid bodies", |r| {
            RigidBodyData::decode(r, version)
        })?;
        if version.supports(Feature::Skeletons) {
            data.skeletons =
                reader.read_list(8, "skeletons", |r| SkeletonData::decode(r, version))?;
        }
        if version.supports(Feature::LabeledMarkers) {
            data.labeled_markers = reader
                .read_list(LABELED_MARKER_MIN_SIZE, "labeled markers", |r| {
                    LabeledMarker::decode(r, version)
                })?;
        }
        if version.supports(Feature::ForcePlates) {
            data.force_plates =
                reader.read_list(8, "force plates", |r| AnalogData::decode(r, version))?;
        }
        if version.supports(Feature::Devices) {
            data.devices = reader.read_list(8, "devices", |r| AnalogData::decode(r, version))?;
        }
        data.suffix = FrameSuffix::decode(reader, version)?;
        let end_marker = reader.read_i32()?;
        if end_marker != 0 {
            trace!(end_marker, "Non-zero end of frame marker");
        }
        Ok(data)
    }
}

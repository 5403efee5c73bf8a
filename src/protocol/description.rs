//! Model definitions (`MODELDEF` payload).
//!
//! A description is a count followed by tagged records. Record kinds that the negotiated
//! version cannot express are left out on encode; receiving one is a malformed payload, as is
//! an unknown tag. Decoding is all-or-nothing.

use std::collections::{BTreeMap, BTreeSet};

use super::WireFormat;
use super::buffer::{MAX_NAME_LEN, Reader, Writer};
use super::data::MoCapData;
use super::features::Feature;
use crate::types::{Matrix3x4, Matrix12x12, Quaternion, Vector3, Version};
use crate::{NatNetError, Result};

/// Record tags used in the description payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DescriptionKind {
    MarkerSet = 0,
    RigidBody = 1,
    Skeleton = 2,
    ForcePlate = 3,
    Device = 4,
    Camera = 5,
}

impl DescriptionKind {
    pub fn from_tag(tag: i32) -> Option<Self> {
        Some(match tag {
            0 => DescriptionKind::MarkerSet,
            1 => DescriptionKind::RigidBody,
            2 => DescriptionKind::Skeleton,
            3 => DescriptionKind::ForcePlate,
            4 => DescriptionKind::Device,
            5 => DescriptionKind::Camera,
            _ => return None,
        })
    }

    /// Feature gating this record kind, if any.
    pub fn feature(self) -> Option<Feature> {
        match self {
            DescriptionKind::ForcePlate => Some(Feature::ForcePlateDescriptions),
            DescriptionKind::Device => Some(Feature::DeviceDescriptions),
            DescriptionKind::Camera => Some(Feature::CameraDescriptions),
            _ => None,
        }
    }

    pub fn is_available(self, version: Version) -> bool {
        self.feature().is_none_or(|feature| version.supports(feature))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarkerSetDescription {
    pub name: String,
    pub markers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RigidBodyMarkerDescription {
    pub name: String,
    pub active_label: i32,
    pub offset: Vector3,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RigidBodyDescription {
    pub name: String,
    pub id: i32,
    /// `-1` when the body has no parent.
    pub parent_id: i32,
    /// Offset relative to the parent.
    pub offset: Vector3,
    pub markers: Vec<RigidBodyMarkerDescription>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SkeletonDescription {
    pub name: String,
    pub id: i32,
    pub rigid_bodies: Vec<RigidBodyDescription>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForcePlateDescription {
    pub id: i32,
    pub serial_number: String,
    pub width: f32,
    pub length: f32,
    /// Electrical center offset.
    pub origin: Vector3,
    pub calibration: Matrix12x12,
    pub corners: Matrix3x4,
    pub plate_type: i32,
    /// 0 calibrated force data, 1 raw analog voltages.
    pub channel_data_type: i32,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceDescription {
    pub id: i32,
    pub name: String,
    pub serial_number: String,
    pub device_type: i32,
    pub channel_data_type: i32,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CameraDescription {
    pub name: String,
    pub position: Vector3,
    pub orientation: Quaternion,
}

fn read_names(reader: &mut Reader<'_>, field: &str) -> Result<Vec<String>> {
    reader.read_list(1, field, |r| r.read_cstring(MAX_NAME_LEN))
}

fn write_names(writer: &mut Writer, names: &[String]) {
    writer.write_list(names, |w, name| w.write_cstring(name));
}

impl WireFormat for MarkerSetDescription {
    fn encode(&self, writer: &mut Writer, _version: Version) {
        writer.write_cstring(&self.name);
        write_names(writer, &self.markers);
    }

    fn decode(reader: &mut Reader<'_>, _version: Version) -> Result<Self> {
        Ok(Self { name: reader.read_cstring(MAX_NAME_LEN)?, markers: read_names(reader, "marker names")? })
    }
}

impl WireFormat for RigidBodyDescription {
    fn encode(&self, writer: &mut Writer, version: Version) {
        if version.supports(Feature::RigidBodyDescriptionName) {
            writer.write_cstring(&self.name);
        }
        writer.write_i32(self.id);
        writer.write_i32(self.parent_id);
        self.offset.write(writer);
        if version.supports(Feature::RigidBodyDescriptionMarkers) {
            writer.write_count(self.markers.len());
            for marker in &self.markers {
                marker.offset.write(writer);
            }
            for marker in &self.markers {
                writer.write_i32(marker.active_label);
            }
            if version.supports(Feature::RigidBodyDescriptionMarkerNames) {
                for marker in &self.markers {
                    writer.write_cstring(&marker.name);
                }
            }
        }
    }

    fn decode(reader: &mut Reader<'_>, version: Version) -> Result<Self> {
        let mut body = RigidBodyDescription::default();
        if version.supports(Feature::RigidBodyDescriptionName) {
            body.name = reader.read_cstring(MAX_NAME_LEN)?;
        }
        body.id = reader.read_i32()?;
        body.parent_id = reader.read_i32()?;
        body.offset = Vector3::read(reader)?;
        if version.supports(Feature::RigidBodyDescriptionMarkers) {
            let count = reader.read_count(Vector3::WIRE_SIZE + 4, "rigid body marker offsets")?;
            let mut markers = Vec::with_capacity(count);
            for _ in 0..count {
                markers.push(RigidBodyMarkerDescription {
                    offset: Vector3::read(reader)?,
                    ..Default::default()
                });
            }
            for marker in &mut markers {
                marker.active_label = reader.read_i32()?;
            }
            if version.supports(Feature::RigidBodyDescriptionMarkerNames) {
                for marker in &mut markers {
                    marker.name = reader.read_cstring(MAX_NAME_LEN)?;
                }
            }
            body.markers = markers;
        }
        Ok(body)
    }
}

impl WireFormat for SkeletonDescription {
    fn encode(&self, writer: &mut Writer, version: Version) {
        writer.write_cstring(&self.name);
        writer.write_i32(self.id);
        writer.write_list(&self.rigid_bodies, |w, body| body.encode(w, version));
    }

    fn decode(reader: &mut Reader<'_>, version: Version) -> Result<Self> {
        Ok(Self {
            name: reader.read_cstring(MAX_NAME_LEN)?,
            id: reader.read_i32()?,
            rigid_bodies: reader.read_list(8 + Vector3::WIRE_SIZE, "skeleton bones", |r| {
                RigidBodyDescription::decode(r, version)
            })?,
        })
    }
}

impl WireFormat for ForcePlateDescription {
    fn encode(&self, writer: &mut Writer, _version: Version) {
        writer.write_i32(self.id);
        writer.write_cstring(&self.serial_number);
        writer.write_f32(self.width);
        writer.write_f32(self.length);
        self.origin.write(writer);
        self.calibration.write(writer);
        self.corners.write(writer);
        writer.write_i32(self.plate_type);
        writer.write_i32(self.channel_data_type);
        write_names(writer, &self.channels);
    }

    fn decode(reader: &mut Reader<'_>, _version: Version) -> Result<Self> {
        Ok(Self {
            id: reader.read_i32()?,
            serial_number: reader.read_cstring(MAX_NAME_LEN)?,
            width: reader.read_f32()?,
            length: reader.read_f32()?,
            origin: Vector3::read(reader)?,
            calibration: Matrix12x12::read(reader)?,
            corners: Matrix3x4::read(reader)?,
            plate_type: reader.read_i32()?,
            channel_data_type: reader.read_i32()?,
            channels: read_names(reader, "force plate channels")?,
        })
    }
}

impl WireFormat for DeviceDescription {
    fn encode(&self, writer: &mut Writer, _version: Version) {
        writer.write_i32(self.id);
        writer.write_cstring(&self.name);
        writer.write_cstring(&self.serial_number);
        writer.write_i32(self.device_type);
        writer.write_i32(self.channel_data_type);
        write_names(writer, &self.channels);
    }

    fn decode(reader: &mut Reader<'_>, _version: Version) -> Result<Self> {
        Ok(Self {
            id: reader.read_i32()?,
            name: reader.read_cstring(MAX_NAME_LEN)?,
            serial_number: reader.read_cstring(MAX_NAME_LEN)?,
            device_type: reader.read_i32()?,
            channel_data_type: reader.read_i32()?,
            channels: read_names(reader, "device channels")?,
        })
    }
}

impl WireFormat for CameraDescription {
    fn encode(&self, writer: &mut Writer, _version: Version) {
        writer.write_cstring(&self.name);
        self.position.write(writer);
        self.orientation.write(writer);
    }

    fn decode(reader: &mut Reader<'_>, _version: Version) -> Result<Self> {
        Ok(Self {
            name: reader.read_cstring(MAX_NAME_LEN)?,
            position: Vector3::read(reader)?,
            orientation: Quaternion::read(reader)?,
        })
    }
}

/// Static definitions of every asset the server streams. Replaced whole on every refresh.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MoCapDescription {
    pub marker_sets: Vec<MarkerSetDescription>,
    pub rigid_bodies: Vec<RigidBodyDescription>,
    pub skeletons: Vec<SkeletonDescription>,
    pub force_plates: Vec<ForcePlateDescription>,
    pub devices: Vec<DeviceDescription>,
    pub cameras: Vec<CameraDescription>,
}

impl MoCapDescription {
    pub fn rigid_body_names(&self) -> BTreeMap<i32, String> {
        self.rigid_bodies.iter().map(|body| (body.id, body.name.clone())).collect()
    }

    pub fn rigid_body(&self, name: &str) -> Option<&RigidBodyDescription> {
        self.rigid_bodies.iter().find(|body| body.name == name)
    }

    pub fn asset_ids(&self) -> AssetIds {
        AssetIds {
            rigid_bodies: self.rigid_bodies.iter().map(|b| b.id).collect(),
            skeletons: self.skeletons.iter().map(|s| s.id).collect(),
            force_plates: self.force_plates.iter().map(|p| p.id).collect(),
            devices: self.devices.iter().map(|d| d.id).collect(),
        }
    }

    fn record_count(&self, version: Version) -> usize {
        let gated = |kind: DescriptionKind, len: usize| if kind.is_available(version) { len } else { 0 };
        self.marker_sets.len()
            + self.rigid_bodies.len()
            + self.skeletons.len()
            + gated(DescriptionKind::ForcePlate, self.force_plates.len())
            + gated(DescriptionKind::Device, self.devices.len())
            + gated(DescriptionKind::Camera, self.cameras.len())
    }
}

fn encode_tagged<T: WireFormat>(
    writer: &mut Writer,
    kind: DescriptionKind,
    records: &[T],
    version: Version,
) {
    if !kind.is_available(version) {
        return;
    }
    for record in records {
        writer.write_i32(kind as i32);
        record.encode(writer, version);
    }
}

impl WireFormat for MoCapDescription {
    fn encode(&self, writer: &mut Writer, version: Version) {
        writer.write_count(self.record_count(version));
        encode_tagged(writer, DescriptionKind::MarkerSet, &self.marker_sets, version);
        encode_tagged(writer, DescriptionKind::RigidBody, &self.rigid_bodies, version);
        encode_tagged(writer, DescriptionKind::Skeleton, &self.skeletons, version);
        encode_tagged(writer, DescriptionKind::ForcePlate, &self.force_plates, version);
        encode_tagged(writer, DescriptionKind::Device, &self.devices, version);
        encode_tagged(writer, DescriptionKind::Camera, &self.cameras, version);
    }

    fn decode(reader: &mut Reader<'_>, version: Version) -> Result<Self> {
        let count = reader.read_count(4, "description records")?;
        let mut description = MoCapDescription::default();
        for index in 0..count {
            let tag = reader.read_i32()?;
            let kind = DescriptionKind::from_tag(tag).ok_or_else(|| {
                NatNetError::malformed("description", format!("record {index} has unknown type {tag}"))
            })?;
            if !kind.is_available(version) {
                return Err(NatNetError::malformed(
                    "description",
                    format!("{kind:?} records do not exist in version {version}"),
                ));
            }
            match kind {
                DescriptionKind::MarkerSet => {
                    description.marker_sets.push(MarkerSetDescription::decode(reader, version)?)
                }
                DescriptionKind::RigidBody => {
                    description.rigid_bodies.push(RigidBodyDescription::decode(reader, version)?)
                }
                DescriptionKind::Skeleton => {
                    description.skeletons.push(SkeletonDescription::decode(reader, version)?)
                }
                DescriptionKind::ForcePlate => {
                    description.force_plates.push(ForcePlateDescription::decode(reader, version)?)
                }
                DescriptionKind::Device => {
                    description.devices.push(DeviceDescription::decode(reader, version)?)
                }
                DescriptionKind::Camera => {
                    description.cameras.push(CameraDescription::decode(reader, version)?)
                }
            }
        }
        Ok(description)
    }
}

/// Asset ids declared by a description, used to flag frames that outran it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssetIds {
    pub rigid_bodies: BTreeSet<i32>,
    pub skeletons: BTreeSet<i32>,
    pub force_plates: BTreeSet<i32>,
    pub devices: BTreeSet<i32>,
}

impl AssetIds {
    /// Whether every top-level asset referenced by `data` is declared.
    pub fn covers(&self, data: &MoCapData) -> bool {
        data.rigid_bodies.iter().all(|b| self.rigid_bodies.contains(&b.id))
            && data.skeletons.iter().all(|s| self.skeletons.contains(&s.id))
            && data.force_plates.iter().all(|p| self.force_plates.contains(&p.id))
            && data.devices.iter().all(|d| self.devices.contains(&d.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::data::RigidBodyData;

    fn body(name: &str, id: i32) -> RigidBodyDescription {
        RigidBodyDescription {
            name: name.into(),
            id,
            parent_id: -1,
            offset: Vector3::default(),
            markers: vec![RigidBodyMarkerDescription {
                name: format!("{name}_1"),
                active_label: 0,
                offset: Vector3::new(0.02, 0.0, 0.0),
            }],
        }
    }

    fn encode(description: &MoCapDescription, version: Version) -> Vec<u8> {
        let mut writer = Writer::new();
        description.encode(&mut writer, version);
        writer.into_inner()
    }

    #[test]
    fn cameras_are_left_out_before_4_0() {
        let description = MoCapDescription {
            rigid_bodies: vec![body("RB0", 1)],
            cameras: vec![CameraDescription { name: "cam".into(), ..Default::default() }],
            ..Default::default()
        };
        let bytes = encode(&description, Version::new(3, 1));
        let decoded =
            MoCapDescription::decode(&mut Reader::new(&bytes), Version::new(3, 1)).expect("decode");
        assert!(decoded.cameras.is_empty());
        assert_eq!(decoded.rigid_bodies.len(), 1);
    }

    #[test]
    fn marker_names_only_from_4_0() {
        let description = MoCapDescription { rigid_bodies: vec![body("RB0", 1)], ..Default::default() };
        let bytes = encode(&description, Version::new(3, 1));
        let decoded =
            MoCapDescription::decode(&mut Reader::new(&bytes), Version::new(3, 1)).expect("decode");
        assert_eq!(decoded.rigid_bodies[0].markers[0].name, "");
        assert_eq!(decoded.rigid_bodies[0].markers[0].offset, Vector3::new(0.02, 0.0, 0.0));

        let bytes = encode(&description, Version::new(4, 0));
        let decoded =
            MoCapDescription::decode(&mut Reader::new(&bytes), Version::new(4, 0)).expect("decode");
        assert_eq!(decoded, description);
    }

    #[test]
    fn unknown_record_type_fails_whole_description() {
        let mut writer = Writer::new();
        writer.write_i32(2);
        writer.write_i32(DescriptionKind::RigidBody as i32);
        body("RB0", 1).encode(&mut writer, Version::new(3, 1));
        writer.write_i32(9);
        let bytes = writer.into_inner();
        let err = MoCapDescription::decode(&mut Reader::new(&bytes), Version::new(3, 1))
            .expect_err("unknown tag");
        assert!(matches!(err, NatNetError::Malformed { .. }));
    }

    #[test]
    fn gated_record_below_its_version_is_malformed() {
        let mut writer = Writer::new();
        writer.write_i32(1);
        writer.write_i32(DescriptionKind::Device as i32);
        let bytes = writer.into_inner();
        assert!(MoCapDescription::decode(&mut Reader::new(&bytes), Version::new(2, 9)).is_err());
    }

    #[test]
    fn asset_ids_flag_undeclared_bodies() {
        let description = MoCapDescription { rigid_bodies: vec![body("RB0", 1)], ..Default::default() };
        let ids = description.asset_ids();
        let mut frame = MoCapData {
            rigid_bodies: vec![RigidBodyData { id: 1, ..Default::default() }],
            ..Default::default()
        };
        assert!(ids.covers(&frame));
        frame.rigid_bodies.push(RigidBodyData { id: 2, ..Default::default() });
        assert!(!ids.covers(&frame));
        assert_eq!(description.rigid_body_names().get(&1).map(String::as_str), Some("RB0"));
    }
}

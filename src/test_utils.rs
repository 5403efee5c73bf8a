//! Fixtures shared by unit tests and benchmarks.
//!
//! Frames and descriptions here exercise every record kind the codec knows. Loopback configs
//! pair a [`MockServer`](crate::MockServer) with a client on freshly probed ports.

#![cfg(any(test, feature = "benchmark"))]

use std::net::{IpAddr, Ipv4Addr};

use crate::client::ClientConfig;
use crate::protocol::data::{
    AnalogData, FrameSuffix, LabeledMarker, MarkerSetData, MoCapData, RigidBodyData,
    RigidBodyMarker, SkeletonData,
};
use crate::protocol::description::{
    CameraDescription, DescriptionKind, DeviceDescription, ForcePlateDescription,
    MarkerSetDescription, MoCapDescription, RigidBodyDescription, RigidBodyMarkerDescription,
    SkeletonDescription,
};
use crate::protocol::features::Feature;
use crate::server::{AssetSource, MockServerConfig, StaticAssets};
use crate::types::{Matrix3x4, Matrix12x12, Quaternion, Vector3, Version};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Two distinct `(command, data)` ports that were free on loopback a moment ago.
pub fn free_ports() -> (u16, u16) {
    let bind = || std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind probe socket");
    let (command, data) = (bind(), bind());
    let port = |socket: &std::net::UdpSocket| socket.local_addr().expect("probe address").port();
    (port(&command), port(&data))
}

#[cfg(test)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Mock server and client configs talking over loopback on fresh ports.
pub fn loopback_configs(version: Version) -> (MockServerConfig, ClientConfig) {
    let (command_port, data_port) = free_ports();
    let server = MockServerConfig {
        address: LOOPBACK,
        command_port,
        data_port,
        version,
        rate: 120,
        ..Default::default()
    };
    let client = ClientConfig {
        client_address: LOOPBACK,
        server_address: LOOPBACK,
        command_port,
        data_port: Some(data_port),
        request_timeout_ms: 250,
        request_attempts: 3,
        discovery_timeout_ms: 500,
        discovery_interval_ms: 50,
        echo_timeout_ms: 250,
        clock_sync_period_ms: 100,
        keep_alive_interval_ms: 1000,
        ..Default::default()
    };
    (server, client)
}

/// What the default mock server describes: `RB0` with id 1 and three markers.
pub fn sample_description() -> MoCapDescription {
    MoCapDescription { rigid_bodies: StaticAssets::default().get_rigid_bodies_def(), ..Default::default() }
}

fn body_description(name: &str, id: i32, parent_id: i32) -> RigidBodyDescription {
    RigidBodyDescription {
        name: name.to_string(),
        id,
        parent_id,
        offset: Vector3::new(0.0, 0.1 * id as f32, 0.0),
        markers: (0..3)
            .map(|index| RigidBodyMarkerDescription {
                name: format!("{name}_marker{index}"),
                active_label: index,
                offset: Vector3::new(0.02 * index as f32, 0.0, -0.01),
            })
            .collect(),
    }
}

/// One record of every description kind.
pub fn rich_description() -> MoCapDescription {
    let mut corners = Matrix3x4::default();
    for (index, corner) in corners.0.iter_mut().enumerate() {
        *corner = Vector3::new(index as f32 * 0.5, 0.0, 0.25);
    }
    MoCapDescription {
        marker_sets: vec![MarkerSetDescription {
            name: "Wand".into(),
            markers: vec!["Wand_1".into(), "Wand_2".into(), "Wand_3".into()],
        }],
        rigid_bodies: vec![body_description("RB0", 1, -1), body_description("RB1", 2, 1)],
        skeletons: vec![SkeletonDescription {
            name: "Actor".into(),
            id: 3,
            rigid_bodies: vec![body_description("Hip", 1, -1), body_description("Spine", 2, 1)],
        }],
        force_plates: vec![ForcePlateDescription {
            id: 1,
            serial_number: "FP-0001".into(),
            width: 0.6,
            length: 0.4,
            origin: Vector3::new(0.0, 0.0, -0.04),
            calibration: Matrix12x12::identity(),
            corners,
            plate_type: 2,
            channel_data_type: 0,
            channels: vec!["Fx".into(), "Fy".into(), "Fz".into()],
        }],
        devices: vec![DeviceDescription {
            id: 2,
            name: "NI-DAQ".into(),
            serial_number: "D-42".into(),
            device_type: 1,
            channel_data_type: 1,
            channels: vec!["A0".into(), "A1".into()],
        }],
        cameras: vec![CameraDescription {
            name: "Cam 1".into(),
            position: Vector3::new(2.0, 2.5, -1.0),
            orientation: Quaternion::new(0.0, 0.7071, 0.0, 0.7071),
        }],
    }
}

fn fit_body_description_to(body: &mut RigidBodyDescription, version: Version) {
    if !version.supports(Feature::RigidBodyDescriptionName) {
        body.name.clear();
    }
    if !version.supports(Feature::RigidBodyDescriptionMarkers) {
        body.markers.clear();
    } else if !version.supports(Feature::RigidBodyDescriptionMarkerNames) {
        for marker in &mut body.markers {
            marker.name.clear();
        }
    }
}

/// Description counterpart of [`fit_frame_to`].
pub fn fit_description_to(mut description: MoCapDescription, version: Version) -> MoCapDescription {
    for body in &mut description.rigid_bodies {
        fit_body_description_to(body, version);
    }
    for skeleton in &mut description.skeletons {
        for bone in &mut skeleton.rigid_bodies {
            fit_body_description_to(bone, version);
        }
    }
    if !DescriptionKind::ForcePlate.is_available(version) {
        description.force_plates.clear();
    }
    if !DescriptionKind::Device.is_available(version) {
        description.devices.clear();
    }
    if !DescriptionKind::Camera.is_available(version) {
        description.cameras.clear();
    }
    description
}

fn body_data(id: i32, frame_number: u32) -> RigidBodyData {
    let step = (frame_number % 1_000) as f32 * 0.001;
    RigidBodyData {
        id,
        position: Vector3::new(step, 1.0, id as f32 * 0.5),
        orientation: Quaternion::IDENTITY,
        markers: (0..3)
            .map(|index| RigidBodyMarker {
                position: Vector3::new(step + 0.02 * index as f32, 1.0, 0.0),
                id: index + 1,
                size: 0.014,
            })
            .collect(),
        error: 0.25,
        tracking_valid: true,
    }
}

/// A frame populated for the newest layout. Pass it through [`fit_frame_to`] before comparing
/// against a decode under an older version.
pub fn rich_frame(frame_number: u32) -> MoCapData {
    MoCapData {
        frame_number,
        marker_sets: vec![MarkerSetData {
            name: "Wand".into(),
            positions: vec![Vector3::new(0.1, 0.2, 0.3), Vector3::new(0.4, 0.5, 0.6)],
        }],
        unlabeled_markers: vec![Vector3::new(-1.0, 0.5, 2.0)],
        rigid_bodies: vec![body_data(1, frame_number), body_data(2, frame_number)],
        skeletons: vec![SkeletonData {
            id: 3,
            rigid_bodies: vec![body_data((3 << 16) | 1, frame_number), body_data((3 << 16) | 2, frame_number)],
        }],
        labeled_markers: vec![
            LabeledMarker {
                id: (1 << 16) | 1,
                position: Vector3::new(0.0, 1.0, 0.5),
                size: 0.014,
                params: 0x02,
                residual: 0.0005,
            },
            LabeledMarker {
                id: 7,
                position: Vector3::new(0.3, 1.1, 0.2),
                size: 0.012,
                params: 0x01,
                residual: 0.0,
            },
        ],
        force_plates: vec![AnalogData { id: 1, channels: vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]] }],
        devices: vec![AnalogData { id: 2, channels: vec![vec![0.5], vec![-0.5]] }],
        suffix: FrameSuffix {
            timecode: frame_number,
            timecode_sub: 2,
            timestamp: f64::from(frame_number % 100_000) / 120.0 + 1.5,
            stamp_camera_mid_exposure: 1_000_000,
            stamp_data_received: 1_002_000,
            stamp_transmit: 1_003_000,
            is_recording: true,
            tracked_models_changed: false,
            is_editing: false,
            bitstream_version_changed: false,
        },
    }
}

fn fit_body_to(body: &mut RigidBodyData, version: Version) {
    if !version.supports(Feature::LegacyRigidBodyMarkers) {
        body.markers.clear();
    } else if !version.supports(Feature::LegacyRigidBodyMarkerDetails) {
        for marker in &mut body.markers {
            marker.id = 0;
            marker.size = 0.0;
        }
    }
    if !version.supports(Feature::RigidBodyError) {
        body.error = 0.0;
    }
    if !version.supports(Feature::RigidBodyParams) {
        body.tracking_valid = false;
    }
}

/// Drops or zeroes whatever `version` cannot carry, giving what a decode would produce.
pub fn fit_frame_to(mut data: MoCapData, version: Version) -> MoCapData {
    for body in &mut data.rigid_bodies {
        fit_body_to(body, version);
    }
    for skeleton in &mut data.skeletons {
        for bone in &mut skeleton.rigid_bodies {
            fit_body_to(bone, version);
        }
    }
    if !version.supports(Feature::Skeletons) {
        data.skeletons.clear();
    }
    if !version.supports(Feature::LabeledMarkers) {
        data.labeled_markers.clear();
    }
    for marker in &mut data.labeled_markers {
        if !version.supports(Feature::LabeledMarkerParams) {
            marker.params = 0;
        }
        if !version.supports(Feature::LabeledMarkerResidual) {
            marker.residual = 0.0;
        }
    }
    if !version.supports(Feature::ForcePlates) {
        data.force_plates.clear();
    }
    if !version.supports(Feature::Devices) {
        data.devices.clear();
    }
    if !version.supports(Feature::DoubleTimestamp) {
        data.suffix.timestamp = f64::from(data.suffix.timestamp as f32);
    }
    if !version.supports(Feature::HighResolutionStamps) {
        data.suffix.stamp_camera_mid_exposure = 0;
        data.suffix.stamp_data_received = 0;
        data.suffix.stamp_transmit = 0;
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_ports_are_distinct() {
        let (command, data) = free_ports();
        assert_ne!(command, data);
        assert_ne!(command, 0);
    }

    #[test]
    fn fitting_descriptions_follows_the_version_steps() {
        assert_eq!(fit_description_to(rich_description(), Version::LATEST), rich_description());

        let at_3_1 = fit_description_to(rich_description(), Version::new(3, 1));
        assert_eq!(at_3_1.rigid_bodies[0].name, "RB0");
        assert!(at_3_1.rigid_bodies[0].markers.iter().all(|marker| marker.name.is_empty()));
        assert_eq!(at_3_1.force_plates.len(), 1);
        assert!(at_3_1.cameras.is_empty());

        let at_1_5 = fit_description_to(rich_description(), Version::new(1, 5));
        assert!(at_1_5.rigid_bodies.iter().all(|body| body.name.is_empty() && body.markers.is_empty()));
        assert!(at_1_5.force_plates.is_empty() && at_1_5.devices.is_empty());
        assert_eq!(at_1_5.marker_sets, rich_description().marker_sets);
    }

    #[test]
    fn fitting_to_latest_keeps_everything_but_legacy_markers() {
        let fitted = fit_frame_to(rich_frame(5), Version::LATEST);
        assert!(fitted.rigid_bodies.iter().all(|body| body.markers.is_empty()));
        assert_eq!(fitted.labeled_markers, rich_frame(5).labeled_markers);
        assert_eq!(fitted.suffix, rich_frame(5).suffix);
    }
}

//! Geometry leaves: little-endian `f32` tuples with no behavior beyond their wire form.

use crate::Result;
use crate::protocol::buffer::{Reader, Writer};

/// A position or offset in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const WIRE_SIZE: usize = 12;

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { x: reader.read_f32()?, y: reader.read_f32()?, z: reader.read_f32()? })
    }

    pub(crate) fn write(&self, writer: &mut Writer) {
        writer.write_f32(self.x);
        writer.write_f32(self.y);
        writer.write_f32(self.z);
    }
}

/// An orientation, stored `(x, y, z, w)` as on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    pub const WIRE_SIZE: usize = 16;
    pub const IDENTITY: Quaternion = Quaternion { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            x: reader.read_f32()?,
            y: reader.read_f32()?,
            z: reader.read_f32()?,
            w: reader.read_f32()?,
        })
    }

    pub(crate) fn write(&self, writer: &mut Writer) {
        for value in [self.x, self.y, self.z, self.w] {
            writer.write_f32(value);
        }
    }
}

/// Four corner points of a force plate, clockwise from the plate's `+x,+y` corner.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Matrix3x4(pub [Vector3; 4]);

impl Matrix3x4 {
    pub const WIRE_SIZE: usize = 48;

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let mut corners = [Vector3::default(); 4];
        for corner in &mut corners {
            *corner = Vector3::read(reader)?;
        }
        Ok(Self(corners))
    }

    pub(crate) fn write(&self, writer: &mut Writer) {
        for corner in &self.0 {
            corner.write(writer);
        }
    }
}

/// Row-major force plate calibration matrix.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Matrix12x12(pub [[f32; 12]; 12]);

impl Matrix12x12 {
    pub const WIRE_SIZE: usize = 12 * 12 * 4;

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let mut rows = [[0.0f32; 12]; 12];
        for row in &mut rows {
            for cell in row.iter_mut() {
                *cell = reader.read_f32()?;
            }
        }
        Ok(Self(rows))
    }

    pub(crate) fn write(&self, writer: &mut Writer) {
        for row in &self.0 {
            for cell in row {
                writer.write_f32(*cell);
            }
        }
    }

    pub fn identity() -> Self {
        let mut rows = [[0.0f32; 12]; 12];
        for (i, row) in rows.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_layout_is_three_le_floats() {
        let mut writer = Writer::new();
        Vector3::new(1.0, -2.0, 0.5).write(&mut writer);
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), Vector3::WIRE_SIZE);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(-2.0f32).to_le_bytes());
        assert_eq!(&bytes[8..12], &0.5f32.to_le_bytes());
    }

    #[test]
    fn quaternion_is_xyzw_on_the_wire() {
        let mut writer = Writer::new();
        Quaternion::new(0.1, 0.2, 0.3, 0.9).write(&mut writer);
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), Quaternion::WIRE_SIZE);
        assert_eq!(&bytes[12..16], &0.9f32.to_le_bytes());
    }

    #[test]
    fn calibration_matrix_reads_back() {
        let matrix = Matrix12x12::identity();
        let mut writer = Writer::new();
        matrix.write(&mut writer);
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), Matrix12x12::WIRE_SIZE);
        let mut reader = Reader::new(&bytes);
        assert_eq!(Matrix12x12::read(&mut reader).expect("matrix"), matrix);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn truncated_corner_block_is_rejected() {
        let bytes = vec![0u8; Matrix3x4::WIRE_SIZE - 1];
        let mut reader = Reader::new(&bytes);
        assert!(Matrix3x4::read(&mut reader).is_err());
    }
}

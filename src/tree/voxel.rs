use cgmath::Point3;

/// One point sample of the cloud.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Voxel {
    pub position: Point3<f64>,
    pub intensity: u16,
}

impl Voxel {
    /// Bytes per encoded voxel: three little-endian f64 coordinates plus the
    /// intensity.
    pub const ENCODED_SIZE: usize = 26;

    pub fn new(x: f64, y: f64, z: f64, intensity: u16) -> Voxel {
        Voxel { position: Point3::new(x, y, z), intensity }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.position.x.to_le_bytes());
        buf.extend_from_slice(&self.position.y.to_le_bytes());
        buf.extend_from_slice(&self.position.z.to_le_bytes());
        buf.extend_from_slice(&self.intensity.to_le_bytes());
    }

    /// Decodes one voxel from a buffer of exactly [`Voxel::ENCODED_SIZE`]
    /// bytes.
    pub fn decode(buf: &[u8]) -> Voxel {
        let coord = |i: usize| f64::from_le_bytes(buf[i..i + 8].try_into().unwrap());
        Voxel {
            position: Point3::new(coord(0), coord(8), coord(16)),
            intensity: u16::from_le_bytes(buf[24..26].try_into().unwrap()),
        }
    }
}

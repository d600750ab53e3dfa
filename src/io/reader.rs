use std::fs::File;
use std::io;
use std::io::BufRead;
use std::path::Path;

use cgmath::Point3;

use crate::tree::bounds::Bounds;
use crate::tree::voxel::Voxel;

/// Reads a plain-text point file: one `x y z [intensity]` sample per line.
/// Blank lines and `#` comments are skipped; anything else that does not
/// parse is an error.
pub fn read_voxels(path: &Path) -> io::Result<Vec<Voxel>> {
    let file = File::open(path)?;
    let reader = io::BufReader::new(file);

    let mut voxels = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let mut coord = || -> Option<f64> { fields.next()?.parse().ok() };
        let (x, y, z) = match (coord(), coord(), coord()) {
            (Some(x), Some(y), Some(z)) => (x, y, z),
            _ => return Err(bad_line(lineno, line)),
        };
        let intensity = match fields.next() {
            Some(field) => field.parse().map_err(|_| bad_line(lineno, line))?,
            None => 0,
        };
        if fields.next().is_some() {
            return Err(bad_line(lineno, line));
        }
        voxels.push(Voxel::new(x, y, z, intensity));
    }
    Ok(voxels)
}

fn bad_line(lineno: usize, line: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line {}: malformed point record {:?}", lineno + 1, line),
    )
}

/// Computes the cubic root bounds that keep every voxel strictly inside.
pub fn cube_bounds(voxels: &[Voxel]) -> Bounds {
    assert!(!voxels.is_empty(), "no voxels to bound");

    let mut min = voxels[0].position;
    let mut max = voxels[0].position;
    for voxel in voxels {
        let p = voxel.position;
        min = Point3::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
        max = Point3::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
    }
    Bounds::cubeify(min, max)
}

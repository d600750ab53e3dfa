use cgmath::{Point3, Vector3};

/// Axis-aligned cube in cloud space. Every chunk's bounds derive from the
/// root cube by repeated halving, so min and max describe them completely.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bounds {
    min: Point3<f64>,
    max: Point3<f64>,
}

impl Bounds {
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Bounds {
        assert!(min.x < max.x && min.y < max.y && min.z < max.z, "degenerate bounds");
        Bounds { min, max }
    }

    /// Builds the smallest cube anchored at `min` that keeps every point
    /// between `min` and `max` strictly inside. Points exactly on the max
    /// face would otherwise escape the deepest octants, so the edge gets a
    /// hair of padding.
    pub fn cubeify(min: Point3<f64>, max: Point3<f64>) -> Bounds {
        let extent = (max.x - min.x).max(max.y - min.y).max(max.z - min.z);
        let edge = if extent > 0.0 { extent * (1.0 + 1e-9) } else { 1.0 };
        Bounds {
            min,
            max: min + Vector3::new(edge, edge, edge),
        }
    }

    pub fn min(&self) -> Point3<f64> {
        self.min
    }

    pub fn edge(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn mid(&self) -> Point3<f64> {
        Point3::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
            (self.min.z + self.max.z) * 0.5,
        )
    }

    pub fn contains(&self, p: Point3<f64>) -> bool {
        p.x >= self.min.x && p.x < self.max.x
            && p.y >= self.min.y && p.y < self.max.y
            && p.z >= self.min.z && p.z < self.max.z
    }

    /// Returns the octant of `p` relative to the midpoint. Bits 0, 1 and 2
    /// are set iff the point's x, y and z are greater than or equal to the
    /// midpoint, so a point exactly on a splitting plane always lands in the
    /// upper octant.
    pub fn direction(&self, p: Point3<f64>) -> u8 {
        let mid = self.mid();
        let mut d = 0u8;
        if p.x >= mid.x {
            d |= 1;
        }
        if p.y >= mid.y {
            d |= 2;
        }
        if p.z >= mid.z {
            d |= 4;
        }
        d
    }

    /// Shrinks the bounds to the given child octant.
    pub fn octant(&self, d: u8) -> Bounds {
        let mid = self.mid();
        let mut min = self.min;
        let mut max = mid;
        if d & 1 != 0 {
            min.x = mid.x;
            max.x = self.max.x;
        }
        if d & 2 != 0 {
            min.y = mid.y;
            max.y = self.max.y;
        }
        if d & 4 != 0 {
            min.z = mid.z;
            max.z = self.max.z;
        }
        Bounds { min, max }
    }
}

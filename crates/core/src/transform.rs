//! Affine transforms from level voxel coordinates into physical space

use cgmath::{Matrix4, Point3, SquareMatrix, Transform, Vector3};

/// 3D affine transform stored as a homogeneous matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform3D {
    matrix: Matrix4<f64>,
}

impl Default for AffineTransform3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform3D {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    /// Diagonal scaling followed by a translation
    pub fn from_scale_and_translation(scale: [f64; 3], translation: [f64; 3]) -> Self {
        let matrix = Matrix4::from_translation(Vector3::from(translation))
            * Matrix4::from_nonuniform_scale(scale[0], scale[1], scale[2]);
        Self { matrix }
    }

    /// Pure translation
    pub fn translation(translation: [f64; 3]) -> Self {
        Self {
            matrix: Matrix4::from_translation(Vector3::from(translation)),
        }
    }

    /// `self ∘ other`: `other` is applied first
    pub fn concatenate(&self, other: &AffineTransform3D) -> Self {
        Self {
            matrix: self.matrix * other.matrix,
        }
    }

    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        self.matrix.transform_point(Point3::from(point)).into()
    }

    /// Inverse transform, or `None` if the matrix is singular
    pub fn inverse(&self) -> Option<Self> {
        self.matrix.invert().map(|matrix| Self { matrix })
    }

    pub fn apply_inverse(&self, point: [f64; 3]) -> Option<[f64; 3]> {
        self.inverse().map(|inverse| inverse.apply(point))
    }

    /// Diagonal of the linear part
    pub fn scale(&self) -> [f64; 3] {
        [self.matrix.x.x, self.matrix.y.y, self.matrix.z.z]
    }

    pub fn translation_part(&self) -> [f64; 3] {
        [self.matrix.w.x, self.matrix.w.y, self.matrix.w.z]
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    /// Row-major 3x4 representation
    pub fn to_rows(&self) -> [[f64; 4]; 3] {
        let m = &self.matrix;
        [
            [m.x.x, m.y.x, m.z.x, m.w.x],
            [m.x.y, m.y.y, m.z.y, m.w.y],
            [m.x.z, m.y.z, m.z.z, m.w.z],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: [f64; 3], b: [f64; 3]) -> bool {
        a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn test_scale_then_translate() {
        let t = AffineTransform3D::from_scale_and_translation([4.0, 4.0, 40.0], [1.0, 2.0, 3.0]);
        assert!(close(t.apply([1.0, 1.0, 1.0]), [5.0, 6.0, 43.0]));
        assert_eq!(t.scale(), [4.0, 4.0, 40.0]);
        assert_eq!(t.translation_part(), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_concatenate_applies_right_operand_first() {
        let scale = AffineTransform3D::from_scale_and_translation([2.0, 2.0, 2.0], [0.0; 3]);
        let shift = AffineTransform3D::translation([0.5, 0.0, 0.0]);

        let t = scale.concatenate(&shift);
        assert!(close(t.apply([0.0, 0.0, 0.0]), [1.0, 0.0, 0.0]));
        assert_eq!(t.translation_part(), [1.0, 0.0, 0.0]);

        let u = shift.concatenate(&scale);
        assert!(close(u.apply([0.0, 0.0, 0.0]), [0.5, 0.0, 0.0]));
    }

    #[test]
    fn test_inverse() {
        let t = AffineTransform3D::from_scale_and_translation([8.0, 8.0, 40.0], [10.0, 0.0, -5.0]);
        let p = [3.5, 7.25, 1.0];
        let back = t.apply_inverse(t.apply(p)).unwrap();
        assert!(close(back, p));

        let singular = AffineTransform3D::from_scale_and_translation([0.0, 1.0, 1.0], [0.0; 3]);
        assert!(singular.inverse().is_none());
    }

    #[test]
    fn test_rows() {
        let t = AffineTransform3D::from_scale_and_translation([2.0, 3.0, 4.0], [5.0, 6.0, 7.0]);
        assert_eq!(
            t.to_rows(),
            [[2.0, 0.0, 0.0, 5.0], [0.0, 3.0, 0.0, 6.0], [0.0, 0.0, 4.0, 7.0]]
        );
        assert_eq!(AffineTransform3D::default(), AffineTransform3D::identity());
    }
}

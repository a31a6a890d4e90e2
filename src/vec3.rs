// src/vec3.rs

/// 3D vector dot product.
#[inline]
pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Component-wise (Hadamard) product. Used to apply the diagonal
/// self-demagnetisation coefficient to a moment vector.
#[inline]
pub fn hadamard(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] * b[0], a[1] * b[1], a[2] * b[2]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hadamard_applies_componentwise() {
        let c = hadamard([-1.0 / 3.0, 0.5, 2.0], [3.0, 2.0, 0.5]);
        assert_eq!(c, [-1.0, 1.0, 1.0]);
    }

    #[test]
    fn dot_of_orthogonal_vectors_is_zero() {
        assert_eq!(dot([1.0, 0.0, 0.0], [0.0, 2.0, 0.0]), 0.0);
        assert_eq!(dot([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]), 32.0);
    }
}

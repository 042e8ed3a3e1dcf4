use nalgebra::{DMatrix, DVector};
use rand::Rng;

/// Xavier-uniform vector init: limit = sqrt(6 / fan).
pub fn xavier_uniform<R: Rng>(dim: usize, rng: &mut R) -> DVector<f32> {
    let limit = (6.0 / dim as f32).sqrt();
    DVector::from_fn(dim, |_, _| rng.gen_range(-limit..limit))
}

/// Xavier-uniform matrix init scaled by fan-in + fan-out.
pub fn xavier_uniform_matrix<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> DMatrix<f32> {
    let limit = (6.0 / (rows + cols) as f32).sqrt();
    DMatrix::from_fn(rows, cols, |_, _| rng.gen_range(-limit..limit))
}

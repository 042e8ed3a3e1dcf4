use nalgebra::{DMatrix, DVector};
use rand::Rng;

use super::initializer;
use super::optimizer::{Optimizer, ParamKey};

/// One-hidden-layer ReLU network producing a scalar score correction.
#[derive(Debug, Clone)]
pub struct Mlp {
    pub(crate) w1: DMatrix<f32>,
    pub(crate) b1: DVector<f32>,
    pub(crate) w2: DVector<f32>,
    pub(crate) b2: f32,
}

/// Accumulated gradients for one optimizer step over an `Mlp`.
#[derive(Debug, Clone)]
pub struct MlpGrads {
    w1: DMatrix<f32>,
    b1: DVector<f32>,
    w2: DVector<f32>,
    b2: f32,
}

impl Mlp {
    pub fn new<R: Rng>(input_dim: usize, hidden_dim: usize, rng: &mut R) -> Self {
        Self {
            w1: initializer::xavier_uniform_matrix(hidden_dim, input_dim, rng),
            b1: DVector::zeros(hidden_dim),
            w2: initializer::xavier_uniform(hidden_dim, rng),
            b2: 0.0,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.w1.ncols()
    }

    pub fn hidden_dim(&self) -> usize {
        self.w1.nrows()
    }

    pub fn forward(&self, x: &DVector<f32>) -> f32 {
        let z = &self.w1 * x + &self.b1;
        let h = z.map(|v| v.max(0.0));
        self.w2.dot(&h) + self.b2
    }

    /// Backprop one example: accumulate weight gradients scaled by
    /// `upstream` and return dL/dx.
    pub fn backward(&self, x: &DVector<f32>, upstream: f32, grads: &mut MlpGrads) -> DVector<f32> {
        let z = &self.w1 * x + &self.b1;
        let h = z.map(|v| v.max(0.0));

        // dL/dh, masked through the ReLU.
        let dh = &self.w2 * upstream;
        let dz = DVector::from_fn(dh.len(), |i, _| if z[i] > 0.0 { dh[i] } else { 0.0 });

        grads.w1 += &dz * x.transpose();
        grads.b1 += &dz;
        grads.w2 += &h * upstream;
        grads.b2 += upstream;

        self.w1.transpose() * dz
    }

    pub fn apply(&mut self, grads: &MlpGrads, opt: &mut dyn Optimizer) {
        opt.update(
            ParamKey::Dense("mlp_w1"),
            self.w1.as_mut_slice(),
            grads.w1.as_slice(),
        );
        opt.update(
            ParamKey::Dense("mlp_b1"),
            self.b1.as_mut_slice(),
            grads.b1.as_slice(),
        );
        opt.update(
            ParamKey::Dense("mlp_w2"),
            self.w2.as_mut_slice(),
            grads.w2.as_slice(),
        );
        let mut b2 = [self.b2];
        opt.update(ParamKey::Dense("mlp_b2"), &mut b2, &[grads.b2]);
        self.b2 = b2[0];
    }
}

impl MlpGrads {
    pub fn zeros(input_dim: usize, hidden_dim: usize) -> Self {
        Self {
            w1: DMatrix::zeros(hidden_dim, input_dim),
            b1: DVector::zeros(hidden_dim),
            w2: DVector::zeros(hidden_dim),
            b2: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_forward_matches_hand_computation() {
        let mut mlp = Mlp::new(2, 2, &mut StdRng::seed_from_u64(0));
        mlp.w1 = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        mlp.b1 = DVector::from_vec(vec![0.0, 0.0]);
        mlp.w2 = DVector::from_vec(vec![1.0, 1.0]);
        mlp.b2 = 0.5;

        // z = [2, -3] -> h = [2, 0] -> out = 2 + 0.5
        let x = DVector::from_vec(vec![2.0, 3.0]);
        assert!((mlp.forward(&x) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_backward_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(3);
        let mlp = Mlp::new(4, 3, &mut rng);
        let x = DVector::from_vec(vec![0.3, -0.2, 0.5, 0.1]);

        let mut grads = MlpGrads::zeros(4, 3);
        let dx = mlp.backward(&x, 1.0, &mut grads);

        let eps = 1e-3;
        for i in 0..x.len() {
            let mut hi = x.clone();
            let mut lo = x.clone();
            hi[i] += eps;
            lo[i] -= eps;
            let numeric = (mlp.forward(&hi) - mlp.forward(&lo)) / (2.0 * eps);
            assert!(
                (numeric - dx[i]).abs() < 1e-2,
                "input grad {i}: numeric {numeric} vs analytic {}",
                dx[i]
            );
        }
    }

    #[test]
    fn test_apply_reduces_output_under_positive_upstream() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut mlp = Mlp::new(3, 4, &mut rng);
        let x = DVector::from_vec(vec![0.4, 0.9, -0.3]);

        let before = mlp.forward(&x);
        let mut grads = MlpGrads::zeros(3, 4);
        mlp.backward(&x, 1.0, &mut grads);
        let mut opt = super::super::optimizer::Sgd::new(0.05);
        mlp.apply(&grads, &mut opt);

        assert!(mlp.forward(&x) < before);
    }
}

use std::collections::HashMap;

/// Identifies one parameter tensor across optimizer steps, so stateful
/// optimizers keep per-parameter moments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    UserEmbedding(usize),
    ItemEmbedding(usize),
    Dense(&'static str),
}

pub trait Optimizer: Send + Sync {
    fn update(&mut self, key: ParamKey, params: &mut [f32], grads: &[f32]);
    fn reset(&mut self);
}

#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, _key: ParamKey, params: &mut [f32], grads: &[f32]) {
        debug_assert_eq!(params.len(), grads.len());
        for (p, g) in params.iter_mut().zip(grads) {
            *p -= self.learning_rate * g;
        }
    }

    fn reset(&mut self) {
        // SGD carries no state.
    }
}

#[derive(Debug, Clone, Default)]
struct AdamSlot {
    m: Vec<f32>,
    v: Vec<f32>,
    t: i32,
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    slots: HashMap<ParamKey, AdamSlot>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            slots: HashMap::new(),
        }
    }

    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self::new(learning_rate, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn update(&mut self, key: ParamKey, params: &mut [f32], grads: &[f32]) {
        debug_assert_eq!(params.len(), grads.len());
        let slot = self.slots.entry(key).or_insert_with(|| AdamSlot {
            m: vec![0.0; params.len()],
            v: vec![0.0; params.len()],
            t: 0,
        });
        slot.t += 1;

        let bias1 = 1.0 - self.beta1.powi(slot.t);
        let bias2 = 1.0 - self.beta2.powi(slot.t);

        for i in 0..params.len() {
            let g = grads[i];
            slot.m[i] = self.beta1 * slot.m[i] + (1.0 - self.beta1) * g;
            slot.v[i] = self.beta2 * slot.v[i] + (1.0 - self.beta2) * g * g;

            let m_hat = slot.m[i] / bias1;
            let v_hat = slot.v[i] / bias2;
            params[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }

    fn reset(&mut self) {
        self.slots.clear();
    }
}

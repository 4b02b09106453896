use comms::{
    Item, Precision,
    specs::{AdamSpec, AlgorithmSpec},
};
use log::debug;

use super::{
    Optimizer, StateEntry, StateLayout, Step,
    optimizer::{buffer_item, check_pair, ensure_allocated, restore_buffer, wrong_algorithm},
};
use crate::{
    Buffer, OptimErr, Result,
    buffer::{Element, with_element},
};

const MT: &str = "adam_mt";
const VT: &str = "adam_vt";
const DENOMS: &str = "adam_denoms";

const ENTRIES: &[StateEntry] = &[
    StateEntry {
        name: MT,
        layout: StateLayout::Sharded,
    },
    StateEntry {
        name: VT,
        layout: StateLayout::Sharded,
    },
    StateEntry {
        name: DENOMS,
        layout: StateLayout::Replicated,
    },
];

/// Adam with optional decoupled weight decay.
///
/// The bias correction denominators are kept in `f64` on the host, they follow
/// `denom = beta * denom + (1 - beta)` which equals `1 - beta^t` for the `t`-th
/// update since the last reset.
#[derive(Debug)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    precision: Precision,
    mt: Option<Buffer>,
    vt: Option<Buffer>,
    denom1: f64,
    denom2: f64,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `precision` - The precision of the parameters it updates and of its moments.
    /// * `spec` - The hyperparameters, `weight_decay` of zero disables decoupled decay.
    ///
    /// # Returns
    /// A new `Adam` instance, its moments are allocated on the first update.
    pub fn new(precision: Precision, spec: AdamSpec) -> Self {
        let AdamSpec {
            beta1,
            beta2,
            epsilon,
            weight_decay,
        } = spec;

        Self {
            beta1,
            beta2,
            epsilon,
            weight_decay,
            precision,
            mt: None,
            vt: None,
            denom1: 0.,
            denom2: 0.,
        }
    }

    /// Returns the first and second moments, `None` before the first update.
    pub fn moments(&self) -> Option<(&Buffer, &Buffer)> {
        self.mt.as_ref().zip(self.vt.as_ref())
    }

    /// Returns the bias correction denominators.
    pub fn denominators(&self) -> (f64, f64) {
        (self.denom1, self.denom2)
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, params: &mut Buffer, grads: &Buffer, step: &Step) -> Result<()> {
        check_pair(params, grads)?;
        let mt = ensure_allocated(&mut self.mt, self.precision, params)?;
        let vt = ensure_allocated(&mut self.vt, self.precision, params)?;

        let b1 = self.beta1 as f64;
        let b2 = self.beta2 as f64;

        self.denom1 = b1 * self.denom1 + (1. - b1);
        self.denom2 = b2 * self.denom2 + (1. - b2);

        // Summed gradients are turned into averaged ones.
        let words = step.words();
        let c1 = (1. - b1) / words;
        let c2 = (1. - b2) / (words * words);

        let scalars = Scalars {
            b1,
            b2,
            c1,
            c2,
            denom1: self.denom1,
            denom2: self.denom2,
            lr: step.learning_rate as f64,
            eps: self.epsilon as f64,
            w: self.weight_decay as f64,
        };

        with_element!(self.precision, T => {
            apply::<T>(
                params.typed_mut()?,
                grads.typed()?,
                mt.typed_mut()?,
                vt.typed_mut()?,
                &scalars,
            )
        });

        Ok(())
    }

    fn reset_stats(&mut self) {
        debug!("resetting adam statistics");

        for moment in [&mut self.mt, &mut self.vt].into_iter().flatten() {
            moment.fill_zero();
        }

        self.denom1 = 0.;
        self.denom2 = 0.;
    }

    fn set_hyper_params(&mut self, spec: &AlgorithmSpec) -> Result<()> {
        match spec {
            AlgorithmSpec::Adam(spec) => {
                self.beta1 = spec.beta1;
                self.beta2 = spec.beta2;
                self.epsilon = spec.epsilon;
                self.weight_decay = spec.weight_decay;
                Ok(())
            }
            _ => Err(wrong_algorithm("adam", spec)),
        }
    }

    fn state_entries(&self) -> &'static [StateEntry] {
        ENTRIES
    }

    fn get_state(&self, name: &str) -> Result<Option<Item>> {
        match name {
            MT => self.mt.as_ref().map(|mt| buffer_item(MT, mt)).transpose(),
            VT => self.vt.as_ref().map(|vt| buffer_item(VT, vt)).transpose(),
            DENOMS => {
                let denoms = [self.denom1, self.denom2];
                let item = Item::from_slice(DENOMS, Precision::Float64, &denoms)?;
                Ok(Some(item))
            }
            _ => Ok(None),
        }
    }

    fn set_state(&mut self, name: &str, precision: Precision, bytes: &[u8]) -> Result<()> {
        match name {
            MT => restore_buffer(&mut self.mt, MT, self.precision, precision, bytes),
            VT => restore_buffer(&mut self.vt, VT, self.precision, precision, bytes),
            DENOMS => {
                let denoms = Buffer::from_bytes(precision, bytes)?.to_vec::<f64>();

                let [denom1, denom2] = denoms[..] else {
                    return Err(OptimErr::CorruptCheckpoint(format!(
                        "{DENOMS} holds {} values instead of 2",
                        denoms.len()
                    )));
                };

                self.denom1 = denom1;
                self.denom2 = denom2;
                Ok(())
            }
            _ => Err(OptimErr::CorruptCheckpoint(format!(
                "adam has no state named {name}"
            ))),
        }
    }
}

/// The per update constants of the Adam rule.
struct Scalars {
    b1: f64,
    b2: f64,
    c1: f64,
    c2: f64,
    denom1: f64,
    denom2: f64,
    lr: f64,
    eps: f64,
    w: f64,
}

fn apply<T: Element>(params: &mut [T], grads: &[T], mt: &mut [T], vt: &mut [T], s: &Scalars) {
    params
        .iter_mut()
        .zip(grads)
        .zip(mt.iter_mut().zip(vt))
        .for_each(|((p, g), (m, v))| {
            let g = g.as_f64();
            let m_next = s.b1 * m.as_f64() + s.c1 * g;
            let v_next = s.b2 * v.as_f64() + s.c2 * g * g;

            *m = T::cast_from(m_next);
            *v = T::cast_from(v_next);

            let m_hat = m_next / s.denom1;
            let v_hat = v_next / s.denom2;
            let p_prev = p.as_f64();
            *p = T::cast_from(p_prev - s.lr * (m_hat / (v_hat.sqrt() + s.eps) + s.w * p_prev));
        });
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;

    fn adam() -> Adam {
        Adam::new(Precision::Float32, AdamSpec::default())
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut adam = adam();
        let mut params = Buffer::from(vec![1f32, -1.]);
        let grads = Buffer::from(vec![1f32, 1.]);

        adam.update_params(&mut params, &grads, &Step::new(0.01)).unwrap();

        let (mt, vt) = adam.moments().unwrap();
        let mt = mt.typed::<f32>().unwrap();
        let vt = vt.typed::<f32>().unwrap();
        assert!((mt[0] - 0.1).abs() < 1e-6);
        assert!((vt[0] - 0.001).abs() < 1e-7);

        let (denom1, denom2) = adam.denominators();
        assert!((denom1 - 0.1).abs() < 1e-6);
        assert!((denom2 - 0.001).abs() < 1e-7);

        let params = params.typed::<f32>().unwrap();
        assert!((params[0] - 0.99).abs() < 1e-5);
        assert!((params[1] + 1.01).abs() < 1e-5);
    }

    #[test]
    fn test_denominators_follow_powers_of_beta() {
        let mut adam = adam();
        let mut params = Buffer::from(vec![0f32]);
        let grads = Buffer::from(vec![0.5f32]);

        for _ in 0..10 {
            adam.update_params(&mut params, &grads, &Step::new(0.01)).unwrap();
        }

        let (denom1, denom2) = adam.denominators();
        assert!((denom1 - (1. - 0.9f64.powi(10))).abs() < 1e-6);
        assert!((denom2 - (1. - 0.999f64.powi(10))).abs() < 1e-6);
    }

    #[test]
    fn test_gradients_are_averaged_over_words() {
        let mut adam = adam();
        let mut params = Buffer::from(vec![0f32]);
        let step = Step {
            learning_rate: 0.01,
            mb_words: Some(4),
            ref_mb_words: NonZeroUsize::new(2),
        };

        adam.update_params(&mut params, &Buffer::from(vec![4f32]), &step).unwrap();

        let (mt, vt) = adam.moments().unwrap();
        assert!((mt.typed::<f32>().unwrap()[0] - 0.1).abs() < 1e-6);
        assert!((vt.typed::<f32>().unwrap()[0] - 0.001).abs() < 1e-7);
    }

    #[test]
    fn test_weight_decay_is_decoupled() {
        let spec = AdamSpec {
            weight_decay: 0.1,
            ..Default::default()
        };
        let mut adam = Adam::new(Precision::Float64, spec);
        let mut params = Buffer::from(vec![2f64]);

        adam.update_params(&mut params, &Buffer::from(vec![0f64]), &Step::new(0.5))
            .unwrap();

        assert!((params.typed::<f64>().unwrap()[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let mut adam = adam();
        let mut params = Buffer::from(vec![1f32, 2.]);

        adam.update_params(&mut params, &Buffer::from(vec![0.3f32, -0.7]), &Step::new(0.01))
            .unwrap();
        adam.reset_stats();

        let (mt, vt) = adam.moments().unwrap();
        assert_eq!(mt.typed::<f32>().unwrap(), &[0., 0.]);
        assert_eq!(vt.typed::<f32>().unwrap(), &[0., 0.]);
        assert_eq!(adam.denominators(), (0., 0.));

        let before = params.clone();
        adam.update_params(&mut params, &Buffer::from(vec![0f32, 0.]), &Step::new(0.01))
            .unwrap();
        assert_eq!(params, before);
    }

    #[test]
    fn test_state_round_trip() {
        let mut adam = adam();
        let mut params = Buffer::from(vec![1f32, 2., 3.]);
        adam.update_params(&mut params, &Buffer::from(vec![0.1f32, 0.2, 0.3]), &Step::new(0.01))
            .unwrap();

        let mut restored = Adam::new(Precision::Float32, AdamSpec::default());
        for entry in ENTRIES {
            let item = adam.get_state(entry.name).unwrap().unwrap();
            restored.set_state(entry.name, item.precision, &item.bytes).unwrap();
        }

        assert_eq!(restored.moments(), adam.moments());
        assert_eq!(restored.denominators(), adam.denominators());
    }

    #[test]
    fn test_corrupt_denominators() {
        let mut adam = adam();
        let res = adam.set_state(DENOMS, Precision::Float64, &[0; 8]);
        assert!(matches!(res, Err(OptimErr::CorruptCheckpoint(_))));
    }

    #[test]
    fn test_half_precision_zero_gradient_stays_finite() {
        let mut adam = Adam::new(Precision::Float16, AdamSpec::default());
        let mut params = Buffer::from(vec![1f32, 1.]).cast(Precision::Float16);
        let grads = Buffer::from(vec![2f32, 0.]).cast(Precision::Float16);

        adam.update_params(&mut params, &grads, &Step::new(0.1)).unwrap();

        let params = params.to_vec::<f32>();
        assert!((params[0] - 0.9).abs() < 1e-3);
        assert_eq!(params[1], 1.);

        let (mt, vt) = adam.moments().unwrap();
        assert!(mt.to_vec::<f32>().iter().chain(&vt.to_vec::<f32>()).all(|v| v.is_finite()));
    }
}

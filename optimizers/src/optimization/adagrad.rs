use comms::{Item, Precision, specs::AlgorithmSpec};
use log::debug;

use super::{
    Optimizer, StateEntry, StateLayout, Step,
    optimizer::{buffer_item, check_pair, ensure_allocated, restore_buffer, wrong_algorithm},
};
use crate::{
    Buffer, OptimErr, Result,
    buffer::{Element, with_element},
};

const GT: &str = "adagrad_gt";

const ENTRIES: &[StateEntry] = &[StateEntry {
    name: GT,
    layout: StateLayout::Sharded,
}];

/// Adagrad, scales every parameter's step by its accumulated squared gradients.
#[derive(Debug)]
pub struct Adagrad {
    epsilon: f32,
    precision: Precision,
    gt: Option<Buffer>,
}

impl Adagrad {
    /// Creates a new `Adagrad` optimizer.
    ///
    /// # Arguments
    /// * `precision` - The precision of the parameters it updates and of its statistics.
    /// * `epsilon` - The stabilizer added to the denominator.
    ///
    /// # Returns
    /// A new `Adagrad` instance, its accumulator is allocated on the first update.
    pub fn new(precision: Precision, epsilon: f32) -> Self {
        Self {
            epsilon,
            precision,
            gt: None,
        }
    }

    /// Returns the running sum of squared gradients, `None` before the first update.
    pub fn accumulator(&self) -> Option<&Buffer> {
        self.gt.as_ref()
    }
}

impl Optimizer for Adagrad {
    fn update_params(&mut self, params: &mut Buffer, grads: &Buffer, step: &Step) -> Result<()> {
        check_pair(params, grads)?;
        let gt = ensure_allocated(&mut self.gt, self.precision, params)?;

        let lr = step.learning_rate as f64;
        let eps = self.epsilon as f64;

        with_element!(self.precision, T => {
            apply::<T>(params.typed_mut()?, grads.typed()?, gt.typed_mut()?, lr, eps)
        });

        Ok(())
    }

    fn reset_stats(&mut self) {
        if let Some(gt) = &mut self.gt {
            debug!("resetting adagrad statistics");
            gt.fill_zero();
        }
    }

    fn set_hyper_params(&mut self, spec: &AlgorithmSpec) -> Result<()> {
        match spec {
            AlgorithmSpec::Adagrad(spec) => {
                self.epsilon = spec.epsilon;
                Ok(())
            }
            _ => Err(wrong_algorithm("adagrad", spec)),
        }
    }

    fn state_entries(&self) -> &'static [StateEntry] {
        ENTRIES
    }

    fn get_state(&self, name: &str) -> Result<Option<Item>> {
        match (name, &self.gt) {
            (GT, Some(gt)) => buffer_item(GT, gt).map(Some),
            _ => Ok(None),
        }
    }

    fn set_state(&mut self, name: &str, precision: Precision, bytes: &[u8]) -> Result<()> {
        match name {
            GT => restore_buffer(&mut self.gt, GT, self.precision, precision, bytes),
            _ => Err(OptimErr::CorruptCheckpoint(format!(
                "adagrad has no state named {name}"
            ))),
        }
    }
}

fn apply<T: Element>(params: &mut [T], grads: &[T], gt: &mut [T], lr: f64, eps: f64) {
    params
        .iter_mut()
        .zip(grads)
        .zip(gt)
        .for_each(|((p, g), acc)| {
            let g = g.as_f64();
            let sum = acc.as_f64() + g * g;

            *acc = T::cast_from(sum);
            *p = T::cast_from(p.as_f64() - lr * g / (sum.sqrt() + eps));
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_squared_gradients() {
        let mut adagrad = Adagrad::new(Precision::Float32, 1e-8);
        let mut params = Buffer::from(vec![1f32]);
        let step = Step::new(0.1);

        adagrad
            .update_params(&mut params, &Buffer::from(vec![2f32]), &step)
            .unwrap();

        assert_eq!(adagrad.accumulator().unwrap().typed::<f32>().unwrap(), &[4.]);
        let after_first = params.typed::<f32>().unwrap()[0];
        assert!((after_first - 0.9).abs() < 1e-6);

        adagrad
            .update_params(&mut params, &Buffer::from(vec![0f32]), &step)
            .unwrap();

        assert_eq!(adagrad.accumulator().unwrap().typed::<f32>().unwrap(), &[4.]);
        assert_eq!(params.typed::<f32>().unwrap()[0], after_first);
    }

    #[test]
    fn test_reset_stats() {
        let mut adagrad = Adagrad::new(Precision::Float64, 1e-8);
        let mut params = Buffer::from(vec![1f64, 1.]);

        adagrad
            .update_params(&mut params, &Buffer::from(vec![1f64, -3.]), &Step::new(0.1))
            .unwrap();
        adagrad.reset_stats();

        assert_eq!(adagrad.accumulator().unwrap().typed::<f64>().unwrap(), &[0., 0.]);
    }

    #[test]
    fn test_rejects_params_in_other_precision() {
        let mut adagrad = Adagrad::new(Precision::Float32, 1e-8);
        let mut params = Buffer::from(vec![1f64]);

        let res = adagrad.update_params(&mut params, &Buffer::from(vec![1f64]), &Step::new(0.1));
        assert!(matches!(res, Err(OptimErr::PrecisionMismatch { .. })));
    }

    #[test]
    fn test_state_round_trip() {
        let mut adagrad = Adagrad::new(Precision::Float32, 1e-8);
        assert!(adagrad.get_state(GT).unwrap().is_none());

        let mut params = Buffer::from(vec![1f32, 2.]);
        adagrad
            .update_params(&mut params, &Buffer::from(vec![0.5f32, 3.]), &Step::new(0.1))
            .unwrap();

        let item = adagrad.get_state(GT).unwrap().unwrap();
        assert_eq!(item.shape, vec![2]);

        let mut restored = Adagrad::new(Precision::Float32, 1e-8);
        restored.set_state(GT, item.precision, &item.bytes).unwrap();
        assert_eq!(restored.accumulator(), adagrad.accumulator());
    }

    #[test]
    fn test_set_hyper_params() {
        let mut adagrad = Adagrad::new(Precision::Float32, 1e-8);

        adagrad
            .set_hyper_params(&AlgorithmSpec::Adagrad(comms::specs::AdagradSpec { epsilon: 1e-3 }))
            .unwrap();
        assert_eq!(adagrad.epsilon, 1e-3);

        assert!(adagrad.set_hyper_params(&AlgorithmSpec::Sgd).is_err());
    }

    #[test]
    fn test_half_precision_zero_gradient_stays_finite() {
        let mut adagrad = Adagrad::new(Precision::Float16, 1e-8);
        let mut params = Buffer::from(vec![1f32, 1.]).cast(Precision::Float16);
        let grads = Buffer::from(vec![2f32, 0.]).cast(Precision::Float16);

        adagrad.update_params(&mut params, &grads, &Step::new(0.1)).unwrap();

        let params = params.to_vec::<f32>();
        assert!((params[0] - 0.9).abs() < 1e-3);
        assert_eq!(params[1], 1.);
    }
}

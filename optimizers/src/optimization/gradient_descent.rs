use comms::specs::AlgorithmSpec;

use super::{
    Optimizer, Step,
    optimizer::{check_pair, wrong_algorithm},
};
use crate::{
    Buffer, Result,
    buffer::{Element, with_element},
};

/// Plain gradient descent, it keeps no statistics.
#[derive(Debug, Default)]
pub struct GradientDescent;

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer.
    pub fn new() -> Self {
        Self
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, params: &mut Buffer, grads: &Buffer, step: &Step) -> Result<()> {
        check_pair(params, grads)?;

        with_element!(params.precision(), T => {
            let lr = T::cast_from(step.learning_rate as f64);

            for (p, g) in params.typed_mut::<T>()?.iter_mut().zip(grads.typed::<T>()?) {
                *p = *p - lr * *g;
            }
        });

        Ok(())
    }

    fn reset_stats(&mut self) {}

    fn set_hyper_params(&mut self, spec: &AlgorithmSpec) -> Result<()> {
        match spec {
            AlgorithmSpec::Sgd => Ok(()),
            _ => Err(wrong_algorithm("sgd", spec)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_params() {
        let mut params = Buffer::from(vec![1f32, 2.]);
        let grads = Buffer::from(vec![0.1f32, 0.2]);

        GradientDescent::new()
            .update_params(&mut params, &grads, &Step::new(0.1))
            .unwrap();

        let params = params.typed::<f32>().unwrap();
        assert!((params[0] - 0.99).abs() < 1e-6);
        assert!((params[1] - 1.98).abs() < 1e-6);
    }

    #[test]
    fn test_size_mismatch() {
        let mut params = Buffer::from(vec![1f32, 2.]);
        let grads = Buffer::from(vec![0.1f32]);

        assert!(
            GradientDescent::new()
                .update_params(&mut params, &grads, &Step::new(0.1))
                .is_err()
        );
    }

    #[test]
    fn test_rejects_other_hyper_params() {
        let spec = AlgorithmSpec::Adagrad(Default::default());
        assert!(GradientDescent::new().set_hyper_params(&spec).is_err());
    }
}

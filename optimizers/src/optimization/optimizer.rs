use std::{fmt::Debug, num::NonZeroUsize};

use comms::{Item, Precision, specs::AlgorithmSpec};

use crate::{Buffer, OptimErr, Result};

/// The per update arguments handed down to an `Optimizer`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    /// The learning rate, already adjusted to the observed batch size.
    pub learning_rate: f32,
    /// The observed batch size in words, if known.
    pub mb_words: Option<usize>,
    /// The batch size the hyperparameters were tuned for, if any.
    pub ref_mb_words: Option<NonZeroUsize>,
}

impl Step {
    /// Creates a new `Step` that doesn't involve batch sizes.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            mb_words: None,
            ref_mb_words: None,
        }
    }

    /// Returns the amount of words the gradient was summed over.
    ///
    /// It is `1` unless both the observed and the reference batch sizes are known.
    pub fn words(&self) -> f64 {
        match (self.mb_words, self.ref_mb_words) {
            (Some(words), Some(_)) => words.max(1) as f64,
            _ => 1.,
        }
    }
}

/// How a piece of optimizer state is spread over devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateLayout {
    /// Each device holds the slice matching its parameter shard.
    Sharded,
    /// Each device holds an identical copy.
    Replicated,
}

/// A named piece of optimizer state that gets checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateEntry {
    pub name: &'static str,
    pub layout: StateLayout,
}

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer: Send + Debug {
    /// Updates `params` in place using `grads`.
    ///
    /// # Arguments
    /// * `params` - The parameters to update.
    /// * `grads` - The gradient, in the same precision as `params`.
    /// * `step` - The learning rate and batch sizes of this update.
    ///
    /// # Returns
    /// An error if `params`, `grads` and the optimizer's statistics don't agree in size or
    /// precision.
    fn update_params(&mut self, params: &mut Buffer, grads: &Buffer, step: &Step) -> Result<()>;

    /// Zeroes every accumulated statistic.
    fn reset_stats(&mut self);

    /// Overrides the algorithm's hyperparameters.
    ///
    /// # Returns
    /// An `InvalidConfig` error if `spec` belongs to another algorithm.
    fn set_hyper_params(&mut self, spec: &AlgorithmSpec) -> Result<()>;

    /// The state this optimizer checkpoints, stateless optimizers have none.
    fn state_entries(&self) -> &'static [StateEntry] {
        &[]
    }

    /// Returns the named piece of state, `None` if it was never allocated.
    fn get_state(&self, _name: &str) -> Result<Option<Item>> {
        Ok(None)
    }

    /// Restores the named piece of state from raw bytes.
    ///
    /// # Arguments
    /// * `name` - One of the names in `state_entries`.
    /// * `precision` - The precision the bytes were stored in.
    /// * `bytes` - This device's part of the state.
    fn set_state(&mut self, _name: &str, _precision: Precision, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn wrong_algorithm(expected: &str, spec: &AlgorithmSpec) -> OptimErr {
    OptimErr::InvalidConfig(format!(
        "cannot apply {} hyperparameters to {expected}",
        spec.name()
    ))
}

pub(crate) fn check_pair(params: &Buffer, grads: &Buffer) -> Result<()> {
    if params.len() != grads.len() {
        return Err(OptimErr::SizeMismatch {
            a: "gradient",
            b: "parameters",
            got: grads.len(),
            expected: params.len(),
        });
    }

    if params.precision() != grads.precision() {
        return Err(OptimErr::PrecisionMismatch {
            got: grads.precision(),
            expected: params.precision(),
        });
    }

    Ok(())
}

/// Returns the lazily allocated statistic in `slot`, allocating it for `params` if needed.
pub(crate) fn ensure_allocated<'a>(
    slot: &'a mut Option<Buffer>,
    precision: Precision,
    params: &Buffer,
) -> Result<&'a mut Buffer> {
    if params.precision() != precision {
        return Err(OptimErr::PrecisionMismatch {
            got: params.precision(),
            expected: precision,
        });
    }

    let stats = slot.get_or_insert_with(|| Buffer::zeros(precision, params.len()));

    if stats.len() != params.len() {
        return Err(OptimErr::SizeMismatch {
            a: "parameters",
            b: "optimizer statistics",
            got: params.len(),
            expected: stats.len(),
        });
    }

    Ok(stats)
}

/// Turns a statistic into a one dimensional checkpoint entry.
pub(crate) fn buffer_item(name: &str, buf: &Buffer) -> Result<Item> {
    let item = Item::new(name, vec![buf.len()], buf.precision(), buf.as_bytes().to_vec())?;
    Ok(item)
}

/// Restores a statistic from checkpoint bytes, casting it into `precision`.
///
/// # Returns
/// A `CorruptCheckpoint` error if the statistic is already allocated with another length.
pub(crate) fn restore_buffer(
    slot: &mut Option<Buffer>,
    name: &str,
    precision: Precision,
    stored: Precision,
    bytes: &[u8],
) -> Result<()> {
    let mut restored = Buffer::from_bytes(stored, bytes)?;

    if stored != precision {
        restored = restored.cast(precision);
    }

    match slot {
        Some(current) if current.len() != restored.len() => Err(OptimErr::CorruptCheckpoint(format!(
            "{name} holds {} values but the optimizer expects {}",
            restored.len(),
            current.len()
        ))),
        _ => {
            *slot = Some(restored);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_words() {
        let mut step = Step::new(0.1);
        assert_eq!(step.words(), 1.);

        step.mb_words = Some(500);
        assert_eq!(step.words(), 1.);

        step.ref_mb_words = NonZeroUsize::new(1000);
        assert_eq!(step.words(), 500.);
    }

    #[test]
    fn test_ensure_allocated_is_idempotent() {
        let params = Buffer::from(vec![1f32, 2., 3.]);
        let mut slot = None;

        let stats = ensure_allocated(&mut slot, Precision::Float32, &params).unwrap();
        stats.typed_mut::<f32>().unwrap()[0] = 7.;

        let stats = ensure_allocated(&mut slot, Precision::Float32, &params).unwrap();

        assert_eq!(stats.typed::<f32>().unwrap(), &[7., 0., 0.]);
    }

    #[test]
    fn test_ensure_allocated_checks_shape_and_precision() {
        let mut slot = None;
        ensure_allocated(&mut slot, Precision::Float32, &Buffer::from(vec![1f32])).unwrap();

        let longer = Buffer::from(vec![1f32, 2.]);
        assert!(ensure_allocated(&mut slot, Precision::Float32, &longer).is_err());

        let wider = Buffer::from(vec![1f64]);
        assert!(ensure_allocated(&mut slot, Precision::Float32, &wider).is_err());
    }

    #[test]
    fn test_restore_buffer_casts_and_validates() {
        let stored = Buffer::from(vec![0.5f32, 0.25]);
        let mut slot = None;

        let bytes = stored.as_bytes();
        restore_buffer(&mut slot, "gt", Precision::Float64, Precision::Float32, bytes).unwrap();
        assert_eq!(slot, Some(Buffer::from(vec![0.5f64, 0.25])));

        let res = restore_buffer(&mut slot, "gt", Precision::Float64, Precision::Float32, &[0; 4]);
        assert!(matches!(res, Err(OptimErr::CorruptCheckpoint(_))));
    }
}

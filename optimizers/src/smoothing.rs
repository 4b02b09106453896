use std::num::NonZeroUsize;

use log::debug;

use crate::{
    Buffer, OptimErr, Result,
    buffer::{Element, with_element},
};

/// Keeps an exponentially weighted moving average of the parameters.
///
/// The average lives in the same precision as the parameters it is fed with and
/// is seeded with a copy of the first parameters seen.
#[derive(Debug)]
pub struct ExponentialSmoothing {
    decay: f64,
    ref_batch_words: Option<NonZeroUsize>,
    avg: Option<Buffer>,
    swapped: bool,
}

impl ExponentialSmoothing {
    /// Creates a new `ExponentialSmoothing` tracker.
    ///
    /// # Arguments
    /// * `decay` - The weight of the newest parameters, in `(0, 1]`.
    /// * `ref_batch_words` - The batch size `decay` was tuned for, `0` disables the correction.
    pub fn new(decay: f32, ref_batch_words: usize) -> Self {
        Self {
            decay: decay as f64,
            ref_batch_words: NonZeroUsize::new(ref_batch_words),
            avg: None,
            swapped: false,
        }
    }

    /// Returns the weight given to the newest parameters on an update.
    ///
    /// # Arguments
    /// * `batches` - The amount of updates seen so far, including the current one.
    /// * `mb_words` - The observed batch size, if known.
    pub fn decay_factor(&self, batches: usize, mb_words: Option<usize>) -> f64 {
        let beta = 1. - self.decay;
        let beta = match (self.ref_batch_words, mb_words) {
            (Some(ref_words), Some(words)) => beta.powf(words as f64 / ref_words.get() as f64),
            _ => beta,
        };

        (1. - beta).max(1. / (batches as f64 + 1.))
    }

    /// Folds `params` into the average.
    ///
    /// # Arguments
    /// * `params` - The freshly updated parameters.
    /// * `batches` - The amount of updates seen so far, including the current one.
    /// * `mb_words` - The observed batch size, if known.
    ///
    /// # Returns
    /// An error if `params` doesn't match the average's length or precision.
    pub fn update(
        &mut self,
        params: &Buffer,
        batches: usize,
        mb_words: Option<usize>,
    ) -> Result<()> {
        if self.avg.is_none() {
            debug!(len = params.len(); "seeding smoothed parameters");
            self.avg = Some(params.clone());
            return Ok(());
        }

        let d = self.decay_factor(batches, mb_words);
        let Some(avg) = self.avg.as_mut() else {
            return Ok(());
        };

        if avg.len() != params.len() {
            return Err(OptimErr::SizeMismatch {
                a: "parameters",
                b: "smoothed parameters",
                got: params.len(),
                expected: avg.len(),
            });
        }

        with_element!(avg.precision(), T => {
            let params = params.typed::<T>()?;
            avg.typed_mut::<T>()?
                .iter_mut()
                .zip(params)
                .for_each(|(a, p)| {
                    *a = T::cast_from((1. - d) * a.as_f64() + d * p.as_f64());
                });
        });

        Ok(())
    }

    /// Returns the smoothed parameters, `None` until the first update.
    pub fn average(&self) -> Option<&Buffer> {
        self.avg.as_ref()
    }

    pub(crate) fn average_mut(&mut self) -> Option<&mut Buffer> {
        self.avg.as_mut()
    }

    /// Returns `true` while the average is swapped into the parameters.
    pub fn is_swapped(&self) -> bool {
        self.swapped
    }

    pub(crate) fn set_swapped(&mut self, swapped: bool) {
        self.swapped = swapped;
    }
}

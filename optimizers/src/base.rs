use std::num::NonZeroUsize;

use comms::{Item, Precision};
use log::{debug, info};

use crate::{
    Buffer, OptimErr, Result,
    clipping::Clipper,
    error::check_len,
    lifecycle::{TrainingObserver, TrainingState},
    optimization::{Optimizer, Step},
    smoothing::ExponentialSmoothing,
    state::{self, GatherState, ScatterState, shard_range},
};

/// Exposes the parameters and gradient of a computation graph.
pub trait ExpressionGraph {
    /// Returns the parameters and their accumulated gradient, both of the same length.
    fn params_and_grads(&mut self) -> (&mut Buffer, &mut Buffer);
}

/// Wraps a concrete `Optimizer` with everything shared by all of them.
///
/// It tracks the learning rate and update count from lifecycle notifications, adjusts
/// the learning rate to the observed batch size, clips gradients, keeps the smoothed
/// parameters and, when the parameters are stored in another precision than the one
/// the optimizer computes in, owns a master copy of the parameters in that precision.
#[derive(Debug)]
pub struct OptimizerBase {
    optimizer: Box<dyn Optimizer>,
    eta: f32,
    ref_mb_words: Option<NonZeroUsize>,
    batches_seen: usize,
    storage_precision: Precision,
    math_precision: Precision,
    clipper: Option<Box<dyn Clipper>>,
    smoothing: Option<ExponentialSmoothing>,
    master: Option<Buffer>,
    staged_grads: Option<Buffer>,
}

impl OptimizerBase {
    /// Creates a new `OptimizerBase`.
    ///
    /// # Arguments
    /// * `optimizer` - The concrete update rule, computing in the second precision.
    /// * `learning_rate` - The base learning rate.
    /// * `ref_mb_words` - The batch size the learning rate was tuned for, `0` disables the
    ///   adjustment.
    /// * `precision` - The parameter storage precision followed by the optimizer's precision.
    ///
    /// # Returns
    /// A new `OptimizerBase` or an `InvalidConfig` error if `precision` has less than two entries.
    pub fn new(
        optimizer: Box<dyn Optimizer>,
        learning_rate: f32,
        ref_mb_words: usize,
        precision: &[Precision],
    ) -> Result<Self> {
        let &[storage_precision, math_precision, ..] = precision else {
            return Err(OptimErr::InvalidConfig(format!(
                "no optimizer precision type specified, got {} of the 2 required precisions",
                precision.len()
            )));
        };

        let ref_mb_words = NonZeroUsize::new(ref_mb_words);
        if let Some(words) = ref_mb_words {
            info!("learning rate gets automatically adjusted as if minibatch size was {words}");
        }

        Ok(Self {
            optimizer,
            eta: learning_rate,
            ref_mb_words,
            batches_seen: 0,
            storage_precision,
            math_precision,
            clipper: None,
            smoothing: None,
            master: None,
            staged_grads: None,
        })
    }

    /// Clips every gradient with `clipper` before it is applied.
    pub fn with_clipper(mut self, clipper: Box<dyn Clipper>) -> Self {
        self.clipper = Some(clipper);
        self
    }

    /// Keeps an exponentially smoothed copy of the parameters.
    pub fn with_smoothing(mut self, smoothing: ExponentialSmoothing) -> Self {
        self.smoothing = Some(smoothing);
        self
    }

    pub fn learning_rate(&self) -> f32 {
        self.eta
    }

    pub fn batches_seen(&self) -> usize {
        self.batches_seen
    }

    /// Returns the storage precision and the optimizer's precision.
    pub fn precision(&self) -> (Precision, Precision) {
        (self.storage_precision, self.math_precision)
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn smoothing(&self) -> Option<&ExponentialSmoothing> {
        self.smoothing.as_ref()
    }

    /// Returns the learning rate for a batch of `mb_words` words.
    ///
    /// With a reference batch size `Tref` configured the base rate is scaled by `T / Tref`,
    /// so a batch twice as large takes a step twice as large. Otherwise, or when the
    /// observed size is unknown, the base rate is returned unchanged.
    pub fn effective_learning_rate(&self, mb_words: Option<usize>) -> f32 {
        match (self.ref_mb_words, mb_words) {
            (Some(ref_words), Some(words)) => {
                (self.eta as f64 * words as f64 / ref_words.get() as f64) as f32
            }
            _ => self.eta,
        }
    }

    /// Applies one update to `params`.
    ///
    /// # Arguments
    /// * `params` - The parameters, in the storage precision.
    /// * `grads` - The gradient of `params`, it may be rescaled in place.
    /// * `mb_words` - The observed batch size, if known.
    /// * `cost_scale` - The factor the loss was scaled by upstream, `1` if it wasn't.
    ///
    /// # Returns
    /// The gradient norm reported by the clipper, `0` without a clipper.
    pub fn update(
        &mut self,
        params: &mut Buffer,
        grads: &mut Buffer,
        mb_words: Option<usize>,
        cost_scale: f32,
    ) -> Result<f32> {
        check_len("gradient", "parameters", grads.len(), params.len())?;

        if params.precision() != self.storage_precision {
            return Err(OptimErr::PrecisionMismatch {
                got: params.precision(),
                expected: self.storage_precision,
            });
        }

        let step = Step {
            learning_rate: self.effective_learning_rate(mb_words),
            mb_words,
            ref_mb_words: self.ref_mb_words,
        };

        let Self {
            optimizer,
            batches_seen,
            math_precision,
            clipper,
            smoothing,
            master,
            staged_grads,
            ..
        } = self;

        if params.precision() == *math_precision {
            let norm = prepare_grads(clipper, grads, cost_scale);
            optimizer.update_params(params, grads, &step)?;
            *batches_seen += 1;

            if let Some(smoothing) = smoothing {
                smoothing.update(params, *batches_seen, mb_words)?;
            }

            return Ok(norm);
        }

        let master = master.get_or_insert_with(|| params.cast(*math_precision));
        check_len("parameters", "master parameters", params.len(), master.len())?;

        let staged =
            staged_grads.get_or_insert_with(|| Buffer::zeros(*math_precision, grads.len()));
        staged.copy_cast_from(grads)?;

        let norm = prepare_grads(clipper, staged, cost_scale);
        optimizer.update_params(master, staged, &step)?;
        *batches_seen += 1;

        if let Some(smoothing) = smoothing {
            smoothing.update(master, *batches_seen, mb_words)?;
        }

        params.copy_cast_from(master)?;
        Ok(norm)
    }

    /// Applies one update to the parameters of `graph`.
    pub fn update_graph<G: ExpressionGraph + ?Sized>(
        &mut self,
        graph: &mut G,
        mb_words: Option<usize>,
        cost_scale: f32,
    ) -> Result<f32> {
        let (params, grads) = graph.params_and_grads();
        self.update(params, grads, mb_words, cost_scale)
    }

    /// Zeroes the concrete optimizer's statistics.
    pub fn reset_stats(&mut self) {
        self.optimizer.reset_stats();
    }

    /// Exchanges shard `i` of `n` of `params` with the smoothed parameters.
    ///
    /// The smoothed parameters cover this optimizer's shard only. With `swap_avg` set the
    /// average is swapped into `params`, without it the live parameters are swapped back.
    /// Asking for the state already in place does nothing, so a swap in followed by a swap
    /// out restores `params` exactly.
    ///
    /// # Arguments
    /// * `params` - The full parameters, in the storage precision.
    /// * `i` - The index of this optimizer's shard.
    /// * `n` - The amount of shards `params` is split in.
    /// * `swap_avg` - Whether the average or the live parameters should end up in `params`.
    pub fn swap_with_smoothed(
        &mut self,
        params: &mut Buffer,
        i: usize,
        n: usize,
        swap_avg: bool,
    ) -> Result<()> {
        if i >= n {
            return Err(OptimErr::InvalidConfig(format!(
                "shard {i} doesn't exist out of {n}"
            )));
        }

        let Some(smoothing) = &mut self.smoothing else {
            return Ok(());
        };

        if smoothing.is_swapped() == swap_avg {
            return Ok(());
        }

        let range = shard_range(params.len(), i, n);
        let cast = self.storage_precision != self.math_precision;

        let Some(avg) = smoothing.average_mut() else {
            return Ok(());
        };
        check_len("parameter shard", "smoothed parameters", range.len(), avg.len())?;

        if !cast {
            params.swap_range(range.start, avg)?;
        } else if swap_avg {
            params.write_range(range.start, avg)?;
        } else {
            let master = self
                .master
                .as_ref()
                .ok_or_else(|| OptimErr::MissingState("master parameters".to_string()))?;
            params.write_range(range.start, master)?;
        }

        debug!(shard = i, swap_avg = swap_avg; "swapped smoothed parameters");
        smoothing.set_swapped(swap_avg);
        Ok(())
    }

    /// Builds the checkpoint entries of a set of per device optimizers.
    ///
    /// # Arguments
    /// * `bases` - The optimizers, one per device, in device order.
    /// * `gather` - The capability used to consolidate sharded state.
    pub fn save<G: GatherState + ?Sized>(
        bases: &[&OptimizerBase],
        gather: &G,
    ) -> Result<Vec<Item>> {
        let opts: Vec<_> = bases.iter().map(|base| base.optimizer.as_ref()).collect();
        state::save(&opts, gather)
    }

    /// Restores a set of per device optimizers from checkpoint entries.
    ///
    /// # Arguments
    /// * `items` - The checkpoint entries.
    /// * `bases` - The optimizers, one per device, in device order.
    /// * `scatter` - The capability used to split sharded state.
    pub fn load<S: ScatterState + ?Sized>(
        items: &[Item],
        bases: &mut [&mut OptimizerBase],
        scatter: &S,
    ) -> Result<()> {
        let mut opts: Vec<_> = bases.iter_mut().map(|base| base.optimizer.as_mut()).collect();
        state::load(items, &mut opts, scatter)
    }

    fn refresh(&mut self, state: &TrainingState) {
        self.eta = state.eta;
        self.batches_seen = state.batches;
    }

    fn refresh_and_reset(&mut self, state: &TrainingState) {
        self.refresh(state);

        if state.reset {
            self.reset_stats();
        }
    }
}

fn prepare_grads(
    clipper: &mut Option<Box<dyn Clipper>>,
    grads: &mut Buffer,
    cost_scale: f32,
) -> f32 {
    if cost_scale != 1. {
        grads.scale(1. / cost_scale as f64);
    }

    clipper.as_mut().map_or(0., |clipper| clipper.clip(grads))
}

impl TrainingObserver for OptimizerBase {
    fn init(&mut self, state: &TrainingState) {
        self.refresh(state);
    }

    fn act_after_loaded(&mut self, state: &TrainingState) {
        self.refresh(state);

        // The master copy holds the live parameters while the average is swapped in.
        let swapped = self.smoothing.as_ref().is_some_and(|s| s.is_swapped());
        if !swapped {
            self.master = None;
        }
    }

    fn act_after_epoch(&mut self, state: &TrainingState) {
        self.refresh_and_reset(state);
    }

    fn act_after_batches(&mut self, state: &TrainingState) {
        self.refresh_and_reset(state);
    }

    fn act_after_stalled(&mut self, state: &TrainingState) {
        self.refresh_and_reset(state);
    }
}

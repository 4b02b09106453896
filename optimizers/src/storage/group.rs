use std::num::NonZeroUsize;

use comms::Item;
use log::info;
use rayon::prelude::*;

use super::shard::DeviceShard;
use crate::{
    Buffer, OptimErr, OptimizerBase, Result,
    error::check_len,
    lifecycle::{TrainingObserver, TrainingState},
    optimization::StateLayout,
    state::{LocalDevices, shard_range},
};

/// Partitions the model's parameters across local devices, each one owning its shard,
/// its gradient and its optimizer, and steps them all in parallel.
#[derive(Debug)]
pub struct DeviceGroup {
    nparams: usize,
    devices: NonZeroUsize,
    shards: Box<[DeviceShard]>,
}

impl DeviceGroup {
    /// Creates a new `DeviceGroup`.
    ///
    /// # Arguments
    /// * `params` - The initial state of every parameter.
    /// * `devices` - The amount of devices, at most one per parameter.
    /// * `optimizer_factory` - Builds the optimizer of the given device index.
    ///
    /// # Returns
    /// A new `DeviceGroup` or an error if the parameters can't be split or an optimizer
    /// can't be built.
    pub fn new<OF>(
        params: &Buffer,
        devices: NonZeroUsize,
        mut optimizer_factory: OF,
    ) -> Result<Self>
    where
        OF: FnMut(usize) -> Result<OptimizerBase>,
    {
        let nparams = params.len();
        let n = devices.get();

        if n > nparams {
            return Err(OptimErr::InvalidConfig(format!(
                "cannot split {nparams} parameters across {n} devices"
            )));
        }

        let shards = (0..n)
            .map(|device| {
                let shard = params.read_range(shard_range(nparams, device, n))?;
                Ok(DeviceShard::new(shard, optimizer_factory(device)?))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(devices = n, params = nparams; "partitioned parameters across devices");

        Ok(Self {
            nparams,
            devices,
            shards: shards.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.nparams
    }

    pub fn is_empty(&self) -> bool {
        self.nparams == 0
    }

    pub fn devices(&self) -> usize {
        self.devices.get()
    }

    fn offset(&self, device: usize) -> usize {
        shard_range(self.nparams, device, self.devices.get()).start
    }

    /// Accumulates `grad` into every device's gradient.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `grad` doesn't cover every parameter.
    pub fn accumulate(&self, grad: &Buffer) -> Result<()> {
        check_len("gradient", "parameters", grad.len(), self.nparams)?;

        self.shards
            .par_iter()
            .enumerate()
            .try_for_each(|(device, shard)| shard.accumulate(grad, self.offset(device)))
    }

    /// Updates every device's parameters with its accumulated gradient.
    ///
    /// # Arguments
    /// * `mb_words` - The observed batch size, if known.
    /// * `cost_scale` - The factor the loss was scaled by upstream, `1` if it wasn't.
    ///
    /// # Returns
    /// The norm of the whole gradient, combined from every device's norm.
    pub fn update(&self, mb_words: Option<usize>, cost_scale: f32) -> Result<f32> {
        let norms = self
            .shards
            .par_iter()
            .map(|shard| shard.update(mb_words, cost_scale))
            .collect::<Result<Vec<_>>>()?;

        Ok(norms.iter().map(|norm| norm * norm).sum::<f32>().sqrt())
    }

    /// Copies every device's parameters into `out`.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `out` isn't the same size as the parameters.
    pub fn pull_params(&self, out: &mut Buffer) -> Result<()> {
        check_len("output buffer", "parameters", out.len(), self.nparams)?;

        for (device, shard) in self.shards.iter().enumerate() {
            shard.pull_params(out, self.offset(device))?;
        }

        Ok(())
    }

    /// Exchanges every device's parameters with its smoothed parameters.
    pub fn swap_with_smoothed(&self, swap_avg: bool) -> Result<()> {
        self.shards
            .iter()
            .try_for_each(|shard| shard.swap_with_smoothed(swap_avg))
    }

    /// Consolidates the state of every device's optimizer into checkpoint entries.
    pub fn save(&self) -> Result<Vec<Item>> {
        let guards: Vec<_> = self.shards.iter().map(|shard| shard.optimizer.lock()).collect();
        let bases: Vec<&OptimizerBase> = guards.iter().map(|guard| &**guard).collect();

        OptimizerBase::save(&bases, &LocalDevices::new(self.devices))
    }

    /// Restores every device's optimizer from checkpoint entries, possibly saved by a
    /// group with another amount of devices.
    ///
    /// # Returns
    /// A `CorruptCheckpoint` error if a sharded entry doesn't cover every parameter.
    pub fn load(&self, items: &[Item]) -> Result<()> {
        let mut guards: Vec<_> = self.shards.iter().map(|shard| shard.optimizer.lock()).collect();

        let sharded = guards[0]
            .optimizer()
            .state_entries()
            .iter()
            .filter(|entry| entry.layout == StateLayout::Sharded)
            .filter_map(|entry| Item::find(items, entry.name));

        for item in sharded {
            if item.len() != self.nparams {
                return Err(OptimErr::CorruptCheckpoint(format!(
                    "{} holds {} values but there are {} parameters",
                    item.name,
                    item.len(),
                    self.nparams
                )));
            }
        }

        let mut bases: Vec<&mut OptimizerBase> =
            guards.iter_mut().map(|guard| &mut **guard).collect();
        OptimizerBase::load(items, &mut bases, &LocalDevices::new(self.devices))
    }

    fn broadcast(&mut self, f: impl Fn(&mut OptimizerBase)) {
        self.shards
            .iter_mut()
            .for_each(|shard| f(shard.optimizer.get_mut()));
    }
}

impl TrainingObserver for DeviceGroup {
    fn init(&mut self, state: &TrainingState) {
        self.broadcast(|base| base.init(state));
    }

    fn act_after_loaded(&mut self, state: &TrainingState) {
        self.broadcast(|base| base.act_after_loaded(state));
    }

    fn act_after_epoch(&mut self, state: &TrainingState) {
        self.broadcast(|base| base.act_after_epoch(state));
    }

    fn act_after_batches(&mut self, state: &TrainingState) {
        self.broadcast(|base| base.act_after_batches(state));
    }

    fn act_after_stalled(&mut self, state: &TrainingState) {
        self.broadcast(|base| base.act_after_stalled(state));
    }
}

use parking_lot::{Mutex, RwLock};

use crate::{Buffer, OptimizerBase, Result};

/// The part of the parameters owned by one device, together with its gradient and optimizer.
#[derive(Debug)]
pub(super) struct DeviceShard {
    params: RwLock<Buffer>,
    grads: Mutex<Buffer>,
    pub(super) optimizer: Mutex<OptimizerBase>,
}

impl DeviceShard {
    /// Creates a new `DeviceShard`.
    ///
    /// # Arguments
    /// * `params` - The initial state of this device's parameters.
    /// * `optimizer` - The optimizer of this device.
    ///
    /// # Returns
    /// A new `DeviceShard` instance with a zeroed gradient.
    pub fn new(params: Buffer, optimizer: OptimizerBase) -> Self {
        let grads = Buffer::zeros(params.precision(), params.len());

        Self {
            params: RwLock::new(params),
            grads: Mutex::new(grads),
            optimizer: Mutex::new(optimizer),
        }
    }

    /// Accumulates this device's slice of `grad`, which starts at `offset`.
    pub fn accumulate(&self, grad: &Buffer, offset: usize) -> Result<()> {
        self.grads.lock().add_range(grad, offset)
    }

    /// Updates the parameters with the accumulated gradient and clears it.
    ///
    /// # Returns
    /// The gradient norm reported by the optimizer's clipper.
    pub fn update(&self, mb_words: Option<usize>, cost_scale: f32) -> Result<f32> {
        let mut params = self.params.write();
        let mut grads = self.grads.lock();

        let norm = self
            .optimizer
            .lock()
            .update(&mut params, &mut grads, mb_words, cost_scale)?;

        grads.fill_zero();
        Ok(norm)
    }

    /// Copies the parameters into `out` starting at `offset`.
    pub fn pull_params(&self, out: &mut Buffer, offset: usize) -> Result<()> {
        out.write_range(offset, &self.params.read())
    }

    /// Exchanges the parameters with the optimizer's smoothed parameters.
    pub fn swap_with_smoothed(&self, swap_avg: bool) -> Result<()> {
        let mut params = self.params.write();
        self.optimizer
            .lock()
            .swap_with_smoothed(&mut params, 0, 1, swap_avg)
    }
}

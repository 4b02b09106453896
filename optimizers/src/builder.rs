use std::num::NonZeroUsize;

use comms::{
    Precision,
    specs::{AlgorithmSpec, ClipperSpec, OptimizerSpec, SmoothingSpec},
};
use log::debug;

use crate::{
    Buffer, OptimErr, OptimizerBase, Result,
    clipping::{Clipper, ElementwiseClipper, NormClipper, ReportNormClipper},
    optimization::{Adagrad, Adam, GradientDescent, Optimizer},
    smoothing::ExponentialSmoothing,
    storage::DeviceGroup,
};

/// Builds `OptimizerBase`s given a specification.
#[derive(Debug, Default)]
pub struct OptimizerBuilder;

impl OptimizerBuilder {
    /// Creates a new `OptimizerBuilder`.
    ///
    /// # Returns
    /// A new `OptimizerBuilder` instance.
    pub fn new() -> Self {
        Self
    }

    /// Builds a new `OptimizerBase` following a spec.
    ///
    /// # Arguments
    /// * `spec` - The specification of the optimizer.
    ///
    /// # Returns
    /// A new `OptimizerBase` or an `InvalidConfig` error if the specification is incomplete
    /// or out of range.
    pub fn build(&self, spec: &OptimizerSpec) -> Result<OptimizerBase> {
        let math_precision = self.resolve_precision(&spec.precision)?;
        let algorithm = spec.resolved_algorithm();
        let optimizer = self.resolve_algorithm(algorithm, math_precision);

        let mut base = OptimizerBase::new(
            optimizer,
            spec.learning_rate,
            spec.mini_batch_words_ref,
            &spec.precision,
        )?;

        if let Some(clipper) = spec.clipper {
            base = base.with_clipper(self.resolve_clipper(clipper));
        }

        let smoothing = spec.smoothing.map(|s| self.resolve_smoothing(s)).transpose()?;
        if let Some(smoothing) = smoothing.flatten() {
            base = base.with_smoothing(smoothing);
        }

        debug!(
            algorithm = algorithm.name(),
            learning_rate = spec.learning_rate,
            overrides = spec.optimizer_params.len();
            "built optimizer"
        );
        Ok(base)
    }

    /// Builds a new `DeviceGroup` holding `params`, with one optimizer per device.
    ///
    /// # Arguments
    /// * `spec` - The specification of every device's optimizer.
    /// * `params` - The initial state of the parameters.
    /// * `devices` - The amount of devices to split the parameters across.
    ///
    /// # Returns
    /// A new `DeviceGroup` or an error if the specification is invalid or the
    /// parameters can't be split.
    pub fn build_devices(
        &self,
        spec: &OptimizerSpec,
        params: &Buffer,
        devices: NonZeroUsize,
    ) -> Result<DeviceGroup> {
        DeviceGroup::new(params, devices, |_| self.build(spec))
    }

    /// Returns the precision the optimizer computes in.
    ///
    /// # Arguments
    /// * `precision` - The storage precision followed by the optimizer's precision.
    fn resolve_precision(&self, precision: &[Precision]) -> Result<Precision> {
        match precision {
            [_, math, ..] => Ok(*math),
            _ => Err(OptimErr::InvalidConfig(format!(
                "no optimizer precision type specified, got {} of the 2 required precisions",
                precision.len()
            ))),
        }
    }

    /// Resolves the concrete `Optimizer`.
    ///
    /// # Arguments
    /// * `spec` - The algorithm and its hyperparameters, with positional overrides applied.
    /// * `precision` - The precision the optimizer computes in.
    fn resolve_algorithm(&self, spec: AlgorithmSpec, precision: Precision) -> Box<dyn Optimizer> {
        match spec {
            AlgorithmSpec::Sgd => Box::new(GradientDescent::new()),
            AlgorithmSpec::Adagrad(spec) => Box::new(Adagrad::new(precision, spec.epsilon)),
            AlgorithmSpec::Adam(spec) => Box::new(Adam::new(precision, spec)),
        }
    }

    fn resolve_clipper(&self, spec: ClipperSpec) -> Box<dyn Clipper> {
        match spec {
            ClipperSpec::Norm { threshold } => Box::new(NormClipper::new(threshold)),
            ClipperSpec::Elementwise { threshold } => Box::new(ElementwiseClipper::new(threshold)),
            ClipperSpec::ReportNorm => Box::new(ReportNormClipper),
        }
    }

    /// Resolves the parameter smoothing.
    ///
    /// # Returns
    /// `None` if `decay` disables smoothing or an `InvalidConfig` error if it's above `1`.
    fn resolve_smoothing(&self, spec: SmoothingSpec) -> Result<Option<ExponentialSmoothing>> {
        let SmoothingSpec {
            decay,
            ref_batch_words,
        } = spec;

        if decay > 1. {
            return Err(OptimErr::InvalidConfig(format!(
                "smoothing decay must be in (0, 1], got {decay}"
            )));
        }

        if decay <= 0. {
            return Ok(None);
        }

        Ok(Some(ExponentialSmoothing::new(decay, ref_batch_words)))
    }
}

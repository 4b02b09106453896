use std::fmt::Debug;

use crate::Buffer;

/// Mitigates exploding gradients by limiting a gradient before it is applied.
pub trait Clipper: Send + Debug {
    /// Clips `grads` in place.
    ///
    /// # Returns
    /// The L2 norm of `grads` as it was observed before clipping.
    fn clip(&mut self, grads: &mut Buffer) -> f32;
}

/// Rescales the whole gradient when its L2 norm exceeds a threshold.
#[derive(Debug, Clone, Copy)]
pub struct NormClipper {
    threshold: f32,
}

impl NormClipper {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Clipper for NormClipper {
    fn clip(&mut self, grads: &mut Buffer) -> f32 {
        let norm = grads.l2_norm();
        let threshold = self.threshold as f64;

        if norm > threshold {
            grads.scale(threshold / norm);
        }

        norm as f32
    }
}

/// Clamps every gradient component to `[-threshold, threshold]`.
#[derive(Debug, Clone, Copy)]
pub struct ElementwiseClipper {
    threshold: f32,
}

impl ElementwiseClipper {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Clipper for ElementwiseClipper {
    fn clip(&mut self, grads: &mut Buffer) -> f32 {
        let norm = grads.l2_norm();
        grads.clamp(self.threshold as f64);
        norm as f32
    }
}

/// Leaves the gradient untouched and only reports its norm.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportNormClipper;

impl Clipper for ReportNormClipper {
    fn clip(&mut self, grads: &mut Buffer) -> f32 {
        grads.l2_norm() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_norm_clipper_rescales_large_gradients() {
        let mut grads = Buffer::from(vec![3f32, 4.]);
        let norm = NormClipper::new(1.).clip(&mut grads);

        assert_eq!(norm, 5.);
        let clipped = grads.typed::<f32>().unwrap();
        assert!((clipped[0] - 0.6).abs() < 1e-6);
        assert!((clipped[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_norm_clipper_keeps_small_gradients() {
        let mut grads = Buffer::from(vec![0.3f32, 0.4]);
        let norm = NormClipper::new(1.).clip(&mut grads);

        assert!((norm - 0.5).abs() < 1e-6);
        assert_eq!(grads.typed::<f32>().unwrap(), &[0.3, 0.4]);
    }

    #[test]
    fn test_elementwise_clipper() {
        let mut grads = Buffer::from(vec![-5f32, 0.5, 2.]);
        ElementwiseClipper::new(1.).clip(&mut grads);
        assert_eq!(grads.typed::<f32>().unwrap(), &[-1., 0.5, 1.]);
    }

    #[test]
    fn test_report_norm_clipper() {
        let mut grads = Buffer::from(vec![6f64, 8.]);
        assert_eq!(ReportNormClipper.clip(&mut grads), 10.);
        assert_eq!(grads.typed::<f64>().unwrap(), &[6., 8.]);
    }
}

mod base;
pub mod buffer;
mod builder;
pub mod clipping;
mod error;
pub mod lifecycle;
pub mod optimization;
pub mod smoothing;
pub mod state;
pub mod storage;

pub use base::{ExpressionGraph, OptimizerBase};
pub use buffer::{Buffer, Element};
pub use builder::OptimizerBuilder;
pub use error::{OptimErr, Result};
pub use lifecycle::{TrainingObserver, TrainingState};

mod optimizer;

pub use optimizer::{
    AdagradSpec, AdamSpec, AlgorithmSpec, ClipperSpec, OptimizerSpec, SmoothingSpec,
};

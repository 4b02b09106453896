mod adagrad;
mod adam;
mod gradient_descent;
mod optimizer;

pub use adagrad::Adagrad;
pub use adam::Adam;
pub use gradient_descent::GradientDescent;
pub use optimizer::{Optimizer, StateEntry, StateLayout, Step};

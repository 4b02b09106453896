mod error;
pub mod io;
mod item;
mod precision;
pub mod specs;

pub use error::{CommsErr, Result};
pub use item::Item;
pub use precision::Precision;

pub mod data;
pub mod error;
pub mod loss;
pub mod model;
pub mod pool;
pub mod training;
pub mod utils;

pub use error::{TrainError, TrainResult};

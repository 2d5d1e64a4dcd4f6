pub mod config;
pub mod errors;
pub mod models;
pub mod scaling;
pub mod services;
pub mod storage;

pub use errors::{ScaleError, ScaleResult};
pub use models::{Direction, ScaleRecord, ScaleRequest};
pub use services::ScaleStore;

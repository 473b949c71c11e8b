pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod redaction;
pub mod reporting;

pub use error::AppError;

pub mod config;
pub mod control;
pub mod core;
pub mod device;
pub mod error;
pub mod persist;
pub mod trial;

pub use error::ExoError;

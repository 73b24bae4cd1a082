pub mod budget;
pub mod confidence;
pub mod config;
pub mod error;
pub mod feedback;
pub mod partner;
pub mod run;
pub mod staging;
pub mod strategy;

pub use budget::*;
pub use confidence::{ConfidenceResult, Factor, FactorScore};
pub use config::Config;
pub use error::{ForageError, Result};
pub use feedback::*;
pub use partner::*;
pub use run::*;
pub use staging::*;
pub use strategy::*;

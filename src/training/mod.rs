//! Training driver
//!
//! - `Trainer`: Adam optimization of the flow likelihood
//! - `StepLr`: step learning-rate decay
//! - `checkpoint`: weights plus training state on disk

pub mod checkpoint;
mod scheduler;
mod trainer;

pub use checkpoint::{load_checkpoint, load_weights, save_checkpoint, CheckpointMetadata};
pub use scheduler::StepLr;
pub use trainer::Trainer;

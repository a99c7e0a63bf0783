//! Training data
//!
//! Random fixed-length segments of speech paired with their precomputed
//! conditioning features.

mod dataset;

pub use dataset::{AudioFeatureDataset, Segment};

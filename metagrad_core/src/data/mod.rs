//! Dataset sources for the episode sampler.

pub mod mnist;

pub use mnist::{load_mnist, synthetic_digits, DigitSet};

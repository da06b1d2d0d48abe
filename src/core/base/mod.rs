//! Shared numerics: negative binomial likelihoods, background fitting,
//! randomised SVD and small matrix utilities.

pub mod likelihood;
pub mod pca_svd;
pub mod stats;
pub mod utils;

//! Cell typing for spatial transcriptomics count data.
//!
//! Assigns every cell of a counts matrix to a discrete cell type via a
//! semi-supervised negative binomial mixture model. Estimation runs on
//! representative subsamples drawn from a geometric binning of a
//! low-dimensional embedding, so that rare populations survive even when
//! only a small fraction of a very large dataset is used per iteration.
//! Reference profiles, anchor cells and cohort labels constrain the fit
//! when available; the number of clusters can be fixed, swept over a range,
//! or set to zero for purely supervised classification.

pub mod core;
pub mod utils;

pub use crate::core::methods::anchors::AnchorParams;
pub use crate::core::methods::insitutype::{
    insitutype, ClusterCount, InsituTypeInputs, InsituTypeParams, InsituTypeResult,
    ReferenceProfiles,
};
pub use crate::core::methods::nbclust::{
    nbclust, ClusterInit, ClusterMethod, NbClustParams, NbClustResult,
};

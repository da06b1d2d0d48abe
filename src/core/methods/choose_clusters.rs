use faer::MatRef;
use log::info;

use crate::core::base::likelihood::total_best_loglik;
use crate::core::base::stats::{aic, bic};
use crate::core::methods::nbclust::{nbclust, ClusterInit, NbClustParams};

// per-candidate iteration cap; the sweep only needs a rough fit
const CHOOSE_MAX_ITERS: usize = 20;

////////////////////////
// Params and results //
////////////////////////

/// Per-candidate diagnostics of the cluster-count sweep
///
/// ### Fields
///
/// * `n_clusts` - The candidate free cluster counts
/// * `total_loglik` - Summed best-cluster log-likelihood per candidate
/// * `aic` - Akaike information criterion per candidate
/// * `bic` - Bayesian information criterion per candidate
#[derive(Clone, Debug)]
pub struct ClusterNumberDiagnostics {
    pub n_clusts: Vec<usize>,
    pub total_loglik: Vec<f64>,
    pub aic: Vec<f64>,
    pub bic: Vec<f64>,
}

////////////////////
// Main functions //
////////////////////

/// Sweep a range of cluster counts and pick the best-scoring one
///
/// Runs the mixture engine once per candidate count on the same subset of
/// cells, each capped at a small number of iterations, and selects the
/// count with the smallest BIC (first encountered on ties).
///
/// ### Params
///
/// * `counts` - Counts matrix of the representative subset (cells x genes)
/// * `bg` - Background level per cell
/// * `fixed_profiles` - Profiles held fixed in every candidate fit
/// * `anchors` - Per-cell anchored cluster index over the full cluster space
/// * `min_clusts` - Smallest candidate free cluster count
/// * `max_clusts` - Largest candidate free cluster count
/// * `params` - Engine parameters (iteration cap is tightened internally)
/// * `seed` - Base seed; each candidate derives its own
///
/// ### Returns
///
/// The winning cluster count and the per-candidate diagnostics.
#[allow(clippy::too_many_arguments)]
pub fn choose_cluster_number(
    counts: MatRef<f64>,
    bg: &[f64],
    fixed_profiles: Option<MatRef<f64>>,
    anchors: Option<&[Option<usize>]>,
    min_clusts: usize,
    max_clusts: usize,
    params: &NbClustParams,
    seed: u64,
) -> Result<(usize, ClusterNumberDiagnostics), String> {
    if min_clusts == 0 {
        return Err("Cluster count range must start at 1 or above".to_string());
    }
    if min_clusts > max_clusts {
        return Err(format!(
            "Invalid cluster count range: {} > {}",
            min_clusts, max_clusts
        ));
    }

    let n_cells = counts.nrows();
    let n_genes = counts.ncols();
    let capped = NbClustParams {
        max_iters: params.max_iters.min(CHOOSE_MAX_ITERS),
        ..params.clone()
    };

    let mut diagnostics = ClusterNumberDiagnostics {
        n_clusts: Vec::new(),
        total_loglik: Vec::new(),
        aic: Vec::new(),
        bic: Vec::new(),
    };
    let mut best_k = min_clusts;
    let mut best_bic = f64::INFINITY;

    for k in min_clusts..=max_clusts {
        let fit = nbclust(
            counts,
            bg,
            k,
            fixed_profiles,
            anchors,
            ClusterInit::RoundRobin,
            &capped,
            seed.wrapping_add(k as u64),
        )?;

        let loglik = total_best_loglik(fit.logliks.as_ref());
        let n_params = fit.profiles.ncols() * n_genes;
        let candidate_bic = bic(loglik, n_params, n_cells);

        diagnostics.n_clusts.push(k);
        diagnostics.total_loglik.push(loglik);
        diagnostics.aic.push(aic(loglik, n_params));
        diagnostics.bic.push(candidate_bic);

        if candidate_bic < best_bic {
            best_bic = candidate_bic;
            best_k = k;
        }
    }

    info!(
        "Selected {} clusters from {}..={} (BIC {:.1})",
        best_k, min_clusts, max_clusts, best_bic
    );

    Ok((best_k, diagnostics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::generate_cell_mixture;

    #[test]
    fn test_picks_true_cluster_count() {
        let sim = generate_cell_mixture(300, 40, 3, 10.0, 21);
        let bg = vec![0.1; 300];

        let (k, diag) = choose_cluster_number(
            sim.counts.as_ref(),
            &bg,
            None,
            None,
            2,
            4,
            &NbClustParams::default(),
            8,
        )
        .unwrap();

        assert_eq!(k, 3);
        assert_eq!(diag.n_clusts, vec![2, 3, 4]);
        // the true count fits far better than the underfit candidate
        assert!(diag.total_loglik[1] > diag.total_loglik[0]);
    }

    #[test]
    fn test_invalid_range_rejected() {
        let sim = generate_cell_mixture(50, 10, 2, 10.0, 2);
        let bg = vec![0.1; 50];

        assert!(choose_cluster_number(
            sim.counts.as_ref(),
            &bg,
            None,
            None,
            0,
            3,
            &NbClustParams::default(),
            1,
        )
        .is_err());
        assert!(choose_cluster_number(
            sim.counts.as_ref(),
            &bg,
            None,
            None,
            4,
            2,
            &NbClustParams::default(),
            1,
        )
        .is_err());
    }
}

use faer::{Mat, MatRef};

use crate::assert_same_len;
use crate::core::base::utils::normalise_matrix_col_l2;

///////////////
// Functions //
///////////////

/// Fit per-cell background from negative probe means
///
/// Regresses the per-cell negative probe mean on the per-cell scaling factor
/// with no intercept, then returns the fitted values as the expected
/// background per cell and gene.
///
/// ### Params
///
/// * `negmean` - Mean negative probe count per cell
/// * `s` - Per-cell scaling factor (total counts over mean total counts)
///
/// ### Returns
///
/// The fitted background level per cell.
pub fn fit_background(negmean: &[f64], s: &[f64]) -> Vec<f64> {
    assert_same_len!(negmean, s);

    let num: f64 = negmean.iter().zip(s.iter()).map(|(&n, &si)| n * si).sum();
    let den: f64 = s.iter().map(|&si| si * si).sum();
    let beta = if den > 1e-12 { num / den } else { 0.0 };

    s.iter().map(|&si| beta * si).collect()
}

/// Cosine similarity of each cell to each profile
///
/// ### Params
///
/// * `counts` - Counts matrix (cells x genes)
/// * `profiles` - Profile matrix (genes x clusters)
///
/// ### Returns
///
/// The cosine similarity matrix (cells x clusters).
pub fn cosine_to_profiles(counts: MatRef<f64>, profiles: MatRef<f64>) -> Mat<f64> {
    let normalised = normalise_matrix_col_l2(&profiles);
    let mut sims = counts * normalised;

    for i in 0..counts.nrows() {
        let norm = counts.row(i).iter().map(|&v| v * v).sum::<f64>().sqrt();
        if norm > 1e-10 {
            for j in 0..sims.ncols() {
                sims[(i, j)] /= norm;
            }
        }
    }

    sims
}

/// Bayesian information criterion
///
/// ### Params
///
/// * `loglik` - Total log-likelihood of the fit
/// * `n_params` - Number of free parameters
/// * `n_obs` - Number of observations
///
/// ### Returns
///
/// The BIC (smaller is better).
#[inline]
pub fn bic(loglik: f64, n_params: usize, n_obs: usize) -> f64 {
    n_params as f64 * (n_obs as f64).ln() - 2.0 * loglik
}

/// Akaike information criterion
///
/// ### Params
///
/// * `loglik` - Total log-likelihood of the fit
/// * `n_params` - Number of free parameters
///
/// ### Returns
///
/// The AIC (smaller is better).
#[inline]
pub fn aic(loglik: f64, n_params: usize) -> f64 {
    2.0 * n_params as f64 - 2.0 * loglik
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    #[test]
    fn test_fit_background_recovers_slope() {
        let s = vec![0.5, 1.0, 1.5, 2.0];
        let negmean: Vec<f64> = s.iter().map(|&si| 0.3 * si).collect();

        let bg = fit_background(&negmean, &s);

        for (b, n) in bg.iter().zip(negmean.iter()) {
            assert!((b - n).abs() < 1e-12);
        }
    }

    #[test]
    fn test_cosine_to_profiles() {
        // cell 0 is colinear with profile 0, orthogonal to profile 1
        let counts = mat![[2.0, 0.0], [0.0, 5.0]];
        let profiles = mat![[1.0, 0.0], [0.0, 1.0]];

        let sims = cosine_to_profiles(counts.as_ref(), profiles.as_ref());

        assert!((sims[(0, 0)] - 1.0).abs() < 1e-12);
        assert!(sims[(0, 1)].abs() < 1e-12);
        assert!((sims[(1, 1)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_information_criteria() {
        assert!((bic(-100.0, 10, 100) - (10.0 * 100.0_f64.ln() + 200.0)).abs() < 1e-12);
        assert!((aic(-100.0, 10) - 220.0).abs() < 1e-12);
    }
}

use faer::{Mat, MatRef};
use rayon::prelude::*;
use statrs::function::gamma::ln_gamma;

use crate::assert_same_len;
use crate::core::base::utils::normalise_matrix_col_sum;
use crate::utils::general::array_max;

///////////////
// Functions //
///////////////

/// Negative binomial log density of a single count
///
/// Parameterised by the mean `mu` and the size (dispersion) parameter. Uses
/// the log-gamma formulation so large counts stay numerically stable. A zero
/// mean with a positive count yields `-inf`.
///
/// ### Params
///
/// * `x` - The observed count
/// * `mu` - The expected count
/// * `size` - The size parameter of the negative binomial
///
/// ### Returns
///
/// The log density.
#[inline]
pub fn nb_log_density(x: f64, mu: f64, size: f64) -> f64 {
    if mu <= 0.0 {
        return if x > 0.0 { f64::NEG_INFINITY } else { 0.0 };
    }
    ln_gamma(x + size) - ln_gamma(size) - ln_gamma(x + 1.0)
        + size * (size / (size + mu)).ln()
        + x * (mu / (size + mu)).ln()
}

/// Per-cell signal scale
///
/// The expected total count of a cell decomposes into signal plus
/// background; the signal scale is the total count with the background mass
/// removed, floored at 1% of the total so heavily background-dominated cells
/// keep a usable scale.
///
/// ### Params
///
/// * `totals` - Total counts per cell
/// * `bg` - Background level per cell (per gene)
/// * `n_genes` - Number of genes
///
/// ### Returns
///
/// The signal scale per cell.
pub fn signal_per_cell(totals: &[f64], bg: &[f64], n_genes: usize) -> Vec<f64> {
    assert_same_len!(totals, bg);
    totals
        .iter()
        .zip(bg.iter())
        .map(|(&t, &b)| (t - b * n_genes as f64).max(0.01 * t))
        .collect()
}

/// Negative binomial log-likelihood of all cells under one profile
///
/// The hypothesised mean for cell `i` and gene `g` is
/// `signal[i] * profile[g] + bg[i]`, with `profile` a distribution over
/// genes.
///
/// ### Params
///
/// * `counts` - Counts matrix (cells x genes)
/// * `profile` - Expression profile, normalised to sum to one
/// * `signal` - Signal scale per cell
/// * `bg` - Background level per cell
/// * `size` - The size parameter of the negative binomial
///
/// ### Returns
///
/// The log-likelihood per cell.
pub fn nb_loglik_profile(
    counts: MatRef<f64>,
    profile: &[f64],
    signal: &[f64],
    bg: &[f64],
    size: f64,
) -> Vec<f64> {
    let n_genes = counts.ncols();
    assert_same_len!(signal, bg);
    assert_eq!(
        profile.len(),
        n_genes,
        "Profile length does not match gene count: {} != {}",
        profile.len(),
        n_genes
    );

    (0..counts.nrows())
        .into_par_iter()
        .map(|i| {
            let s = signal[i];
            let b = bg[i];
            let mut ll = 0.0;
            for g in 0..n_genes {
                let mu = s * profile[g] + b;
                ll += nb_log_density(counts[(i, g)], mu, size);
                if ll == f64::NEG_INFINITY {
                    break;
                }
            }
            ll
        })
        .collect()
}

/// Negative binomial log-likelihood matrix over a set of profiles
///
/// Columns of `profiles` are normalised to distributions internally, so raw
/// expression scales are accepted. Profile columns are evaluated in
/// parallel.
///
/// ### Params
///
/// * `counts` - Counts matrix (cells x genes)
/// * `profiles` - Profile matrix (genes x clusters), any positive scale
/// * `signal` - Signal scale per cell
/// * `bg` - Background level per cell
/// * `size` - The size parameter of the negative binomial
///
/// ### Returns
///
/// The log-likelihood matrix (cells x clusters).
pub fn nb_loglik_matrix(
    counts: MatRef<f64>,
    profiles: MatRef<f64>,
    signal: &[f64],
    bg: &[f64],
    size: f64,
) -> Mat<f64> {
    assert_eq!(
        counts.ncols(),
        profiles.nrows(),
        "Counts genes do not match profile genes: {} != {}",
        counts.ncols(),
        profiles.nrows()
    );

    let normalised = normalise_matrix_col_sum(&profiles);
    let n_clusts = profiles.ncols();

    let cols: Vec<Vec<f64>> = (0..n_clusts)
        .into_par_iter()
        .map(|j| {
            let profile: Vec<f64> = normalised.col(j).iter().cloned().collect();
            nb_loglik_profile(counts, &profile, signal, bg, size)
        })
        .collect();

    Mat::from_fn(counts.nrows(), n_clusts, |i, j| cols[j][i])
}

/// Log-likelihood of the background-only model
///
/// ### Params
///
/// * `counts` - Counts matrix (cells x genes)
/// * `bg` - Background level per cell
/// * `size` - The size parameter of the negative binomial
///
/// ### Returns
///
/// The log-likelihood per cell under pure background.
pub fn nb_loglik_null(counts: MatRef<f64>, bg: &[f64], size: f64) -> Vec<f64> {
    let n_genes = counts.ncols();

    (0..counts.nrows())
        .into_par_iter()
        .map(|i| {
            let b = bg[i];
            let mut ll = 0.0;
            for g in 0..n_genes {
                ll += nb_log_density(counts[(i, g)], b, size);
                if ll == f64::NEG_INFINITY {
                    break;
                }
            }
            ll
        })
        .collect()
}

/// Convert a log-likelihood matrix into posterior probabilities
///
/// Row-wise log-sum-exp with max subtraction, so large magnitude
/// log-likelihoods do not overflow. Every returned row sums to one.
///
/// ### Params
///
/// * `logliks` - Log-likelihood matrix (cells x clusters)
///
/// ### Returns
///
/// The posterior probability matrix, or an error if any row consists solely
/// of `-inf`.
pub fn to_posterior(logliks: MatRef<f64>) -> Result<Mat<f64>, String> {
    let n_clusts = logliks.ncols();

    let rows: Vec<Vec<f64>> = (0..logliks.nrows())
        .into_par_iter()
        .map(|i| {
            let lls: Vec<f64> = logliks.row(i).iter().cloned().collect();
            let max_ll = array_max(&lls);
            if max_ll == f64::NEG_INFINITY {
                return Err(format!(
                    "All cluster log-likelihoods are -inf for cell {}",
                    i
                ));
            }
            let mut probs: Vec<f64> = lls.iter().map(|&ll| (ll - max_ll).exp()).collect();
            let total: f64 = probs.iter().sum();
            for p in probs.iter_mut() {
                *p /= total;
            }
            Ok(probs)
        })
        .collect::<Result<Vec<Vec<f64>>, String>>()?;

    Ok(Mat::from_fn(logliks.nrows(), n_clusts, |i, j| rows[i][j]))
}

/// Summed best-cluster log-likelihood
///
/// ### Params
///
/// * `logliks` - Log-likelihood matrix (cells x clusters)
///
/// ### Returns
///
/// The sum over cells of each cell's maximum log-likelihood.
pub fn total_best_loglik(logliks: MatRef<f64>) -> f64 {
    (0..logliks.nrows())
        .into_par_iter()
        .map(|i| {
            logliks
                .row(i)
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    #[test]
    fn test_nb_log_density_known_value() {
        // x = 3, mu = 2, size = 10, checked against the closed form
        let ll = nb_log_density(3.0, 2.0, 10.0);
        assert!((ll + 1.804865).abs() < 1e-4);
    }

    #[test]
    fn test_nb_log_density_zero_mean() {
        assert_eq!(nb_log_density(2.0, 0.0, 10.0), f64::NEG_INFINITY);
        assert_eq!(nb_log_density(0.0, 0.0, 10.0), 0.0);
    }

    #[test]
    fn test_nb_log_density_large_counts_stable() {
        let ll = nb_log_density(1e5, 9e4, 10.0);
        assert!(ll.is_finite());
    }

    #[test]
    fn test_to_posterior_rows_sum_to_one() {
        let logliks = mat![[-10.0, -12.0, -11.0], [-500.0, -1.0, -2.0]];
        let post = to_posterior(logliks.as_ref()).unwrap();

        for i in 0..post.nrows() {
            let row_sum: f64 = post.row(i).iter().sum();
            assert!((row_sum - 1.0).abs() < 1e-6);
        }
        // the dominant likelihood dominates the posterior
        assert!(post[(1, 1)] > 0.7);
    }

    #[test]
    fn test_to_posterior_all_neg_inf_errors() {
        let logliks = mat![[f64::NEG_INFINITY, f64::NEG_INFINITY]];
        assert!(to_posterior(logliks.as_ref()).is_err());
    }

    #[test]
    fn test_loglik_matrix_prefers_matching_profile() {
        // two genes, two profiles concentrated on opposite genes
        let counts = mat![[20.0, 1.0], [1.0, 20.0]];
        let profiles = mat![[0.9, 0.1], [0.1, 0.9]];
        let totals = vec![21.0, 21.0];
        let bg = vec![0.1, 0.1];
        let signal = signal_per_cell(&totals, &bg, 2);

        let logliks = nb_loglik_matrix(counts.as_ref(), profiles.as_ref(), &signal, &bg, 10.0);

        assert!(logliks[(0, 0)] > logliks[(0, 1)]);
        assert!(logliks[(1, 1)] > logliks[(1, 0)]);
    }

    #[test]
    fn test_total_best_loglik() {
        let logliks = mat![[-1.0, -3.0], [-4.0, -2.0]];
        assert!((total_best_loglik(logliks.as_ref()) + 3.0).abs() < 1e-12);
    }
}

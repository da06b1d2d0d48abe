use faer::{Mat, MatRef};
use rand::prelude::*;
use rand_distr::Normal;

use crate::core::base::utils::scale_matrix_col;

////////////////
// Structures //
////////////////

/// Structure for random SVD results
///
/// ### Fields
///
/// * `u` - Matrix u of the SVD decomposition
/// * `v` - Matrix v of the SVD decomposition
/// * `s` - Singular values of the SVD decomposition
#[derive(Clone, Debug)]
pub struct RandomSvdResults {
    pub u: Mat<f64>,
    pub v: Mat<f64>,
    pub s: Vec<f64>,
}

///////////////
// Functions //
///////////////

/// Randomised SVD
///
/// ### Params
///
/// * `x` - The matrix on which to apply the randomised SVD.
/// * `rank` - The target rank of the approximation (number of singular values,
///   vectors to compute).
/// * `seed` - Random seed for reproducible results.
/// * `oversampling` - Additional samples beyond the target rank to improve
///   accuracy. Defaults to 10 if not specified.
/// * `n_power_iter` - Number of power iterations to perform for better
///   approximation quality. More iterations generally improve accuracy but
///   increase computation time. Defaults to 2 if not specified.
///
/// ### Returns
///
/// The randomised SVD results in form of `RandomSvdResults`.
pub fn randomised_svd(
    x: MatRef<f64>,
    rank: usize,
    seed: u64,
    oversampling: Option<usize>,
    n_power_iter: Option<usize>,
) -> RandomSvdResults {
    let ncol = x.ncols();
    let nrow = x.nrows();

    // Oversampling for better accuracy
    let os = oversampling.unwrap_or(10);
    let sample_size = (rank + os).min(ncol.min(nrow));
    let n_iter = n_power_iter.unwrap_or(2);

    // Create a random matrix
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let omega = Mat::from_fn(ncol, sample_size, |_, _| normal.sample(&mut rng));

    // Multiply random matrix with original and use QR composition to get
    // low rank approximation of x
    let y = x * omega;

    let mut q = y.qr().compute_thin_Q();
    for _ in 0..n_iter {
        let z = x.transpose() * q;
        q = (x * z).qr().compute_thin_Q();
    }

    // Perform the SVD on the low-rank approximation
    let b = q.transpose() * x;
    let svd = b.thin_svd().unwrap();

    RandomSvdResults {
        u: q * svd.U(),
        v: svd.V().cloned(),
        s: svd.S().column_vector().iter().copied().collect(),
    }
}

/// Principal component scores of log-transformed counts
///
/// Applies `log1p` to the counts, centres the gene columns and projects onto
/// the top principal components via the randomised SVD. The scores feed the
/// geometric binning used for representative subsampling.
///
/// ### Params
///
/// * `counts` - Counts matrix (cells x genes)
/// * `n_pcs` - Number of principal components to keep
/// * `seed` - Random seed for the randomised SVD
///
/// ### Returns
///
/// The score matrix (cells x components).
pub fn log_pca_scores(counts: MatRef<f64>, n_pcs: usize, seed: u64) -> Mat<f64> {
    let logged = Mat::from_fn(counts.nrows(), counts.ncols(), |i, j| counts[(i, j)].ln_1p());
    let centred = scale_matrix_col(&logged.as_ref(), false);

    let svd = randomised_svd(centred.as_ref(), n_pcs, seed, None, None);
    let k = n_pcs.min(svd.s.len());

    Mat::from_fn(counts.nrows(), k, |i, j| svd.u[(i, j)] * svd.s[j])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_randomised_svd_reconstruction() {
        // rank-2 matrix is recovered exactly by a rank-2 approximation
        let a = Mat::from_fn(20, 6, |i, j| (i as f64) * (j as f64 + 1.0));
        let svd = randomised_svd(a.as_ref(), 2, 42, None, None);

        let k = svd.s.len();
        let mut approx = Mat::<f64>::zeros(20, 6);
        for i in 0..20 {
            for j in 0..6 {
                let mut val = 0.0;
                for r in 0..k {
                    val += svd.u[(i, r)] * svd.s[r] * svd.v[(j, r)];
                }
                approx[(i, j)] = val;
            }
        }

        for i in 0..20 {
            for j in 0..6 {
                assert!((approx[(i, j)] - a[(i, j)]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_log_pca_scores_shape() {
        let counts = Mat::from_fn(30, 10, |i, j| ((i * 7 + j * 3) % 11) as f64);
        let scores = log_pca_scores(counts.as_ref(), 4, 7);

        assert_eq!(scores.nrows(), 30);
        assert!(scores.ncols() <= 4);
    }
}

use faer::MatRef;
use rand::prelude::*;
use rustc_hash::FxHashMap;

use crate::utils::general::array_max_min;

/////////////
// Helpers //
/////////////

/// Bin coordinates of every cell for a given cube width
///
/// ### Params
///
/// * `norm` - Normalised embedding coordinates, one Vec per active dimension
/// * `width` - Side length of the hypercube bins on the unit interval
///
/// ### Returns
///
/// The integer bin coordinates per cell.
fn bin_coordinates(norm: &[Vec<f64>], width: f64) -> Vec<Vec<u32>> {
    let n_cells = norm[0].len();

    (0..n_cells)
        .map(|i| {
            norm.iter()
                .map(|dim| (dim[i] / width).floor() as u32)
                .collect()
        })
        .collect()
}

/// Count the occupied bins for a given cube width
fn occupied_bins(norm: &[Vec<f64>], width: f64) -> usize {
    let coords = bin_coordinates(norm, width);
    let mut seen: FxHashMap<Vec<u32>, ()> = FxHashMap::default();
    for key in coords {
        seen.insert(key, ());
    }
    seen.len()
}

////////////////////
// Main functions //
////////////////////

/// Partition cells into geometric bins ("plaid") of an embedding
///
/// Normalises every embedding dimension to the unit interval and covers the
/// space with equal-sided hypercubes. The cube side is found by binary
/// search so that the number of occupied cubes approaches `target_bins`.
/// Deterministic given the embedding.
///
/// ### Params
///
/// * `embedding` - Low-dimensional embedding (cells x dimensions)
/// * `target_bins` - Desired number of occupied bins, typically the smallest
///   subsample size drawn anywhere downstream
///
/// ### Returns
///
/// A dense bin id per cell.
pub fn compute_plaid(embedding: MatRef<f64>, target_bins: usize) -> Result<Vec<usize>, String> {
    let n_cells = embedding.nrows();
    if n_cells == 0 {
        return Err("Cannot compute a plaid for an empty embedding".to_string());
    }
    if target_bins == 0 {
        return Err("Target bin count must be positive".to_string());
    }

    let target = target_bins.min(n_cells);

    // normalise each non-degenerate dimension to [0, 1]
    let mut norm: Vec<Vec<f64>> = Vec::with_capacity(embedding.ncols());
    for j in 0..embedding.ncols() {
        let col: Vec<f64> = embedding.col(j).iter().cloned().collect();
        let (min_val, max_val) = array_max_min(&col);
        let range = max_val - min_val;
        if range > 1e-12 {
            norm.push(col.iter().map(|&x| (x - min_val) / range).collect());
        }
    }

    // fully degenerate embedding collapses into a single bin
    if norm.is_empty() {
        return Ok(vec![0; n_cells]);
    }

    // binary search on the cube side; wider cubes give fewer occupied bins
    let mut lo = 1e-4;
    let mut hi = 1.0 + 1e-9;
    let mut best_width = hi;
    let mut best_diff = usize::MAX;
    for _ in 0..40 {
        let mid = 0.5 * (lo + hi);
        let occ = occupied_bins(&norm, mid);
        let diff = occ.abs_diff(target);
        if diff < best_diff {
            best_diff = diff;
            best_width = mid;
        }
        if occ > target {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let coords = bin_coordinates(&norm, best_width);
    let mut bin_ids: FxHashMap<Vec<u32>, usize> = FxHashMap::default();
    let mut plaid = Vec::with_capacity(n_cells);
    for key in coords {
        let next_id = bin_ids.len();
        let id = *bin_ids.entry(key).or_insert(next_id);
        plaid.push(id);
    }

    Ok(plaid)
}

/// Draw a representative subsample from a plaid
///
/// Bins contribute as equal a share as possible: one cell per bin per round
/// until `n` cells are collected, with per-bin order and the bin visiting
/// order shuffled. The returned indices are unique, sorted, and never exceed
/// `n` or the population size.
///
/// ### Params
///
/// * `plaid` - Bin id per cell as produced by `compute_plaid`
/// * `n` - Maximum number of cells to draw
/// * `rng` - Random number generator owned by the caller
///
/// ### Returns
///
/// Sorted cell indices of the subsample.
pub fn sample_from_plaid(plaid: &[usize], n: usize, rng: &mut StdRng) -> Vec<usize> {
    if plaid.is_empty() || n == 0 {
        return Vec::new();
    }

    let n_bins = plaid.iter().max().unwrap() + 1;
    let mut bins: Vec<Vec<usize>> = vec![Vec::new(); n_bins];
    for (cell, &bin) in plaid.iter().enumerate() {
        bins[bin].push(cell);
    }

    for bin in bins.iter_mut() {
        bin.shuffle(rng);
    }
    let mut bin_order: Vec<usize> = (0..n_bins).collect();
    bin_order.shuffle(rng);

    let n = n.min(plaid.len());
    let mut out = Vec::with_capacity(n);
    let mut round = 0;
    'outer: loop {
        let mut drew_any = false;
        for &b in &bin_order {
            if let Some(&cell) = bins[b].get(round) {
                out.push(cell);
                drew_any = true;
                if out.len() == n {
                    break 'outer;
                }
            }
        }
        if !drew_any {
            break;
        }
        round += 1;
    }

    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;
    use rustc_hash::FxHashSet;

    fn two_blob_embedding(n_major: usize, n_minor: usize) -> Mat<f64> {
        // a large blob near the origin and a small distant one
        Mat::from_fn(n_major + n_minor, 2, |i, j| {
            let jitter = ((i * 13 + j * 7) % 10) as f64 * 0.05;
            if i < n_major {
                jitter
            } else {
                10.0 + jitter
            }
        })
    }

    #[test]
    fn test_plaid_is_deterministic() {
        let emb = two_blob_embedding(95, 5);
        let a = compute_plaid(emb.as_ref(), 20).unwrap();
        let b = compute_plaid(emb.as_ref(), 20).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sample_bounds_and_uniqueness() {
        let emb = two_blob_embedding(95, 5);
        let plaid = compute_plaid(emb.as_ref(), 20).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        let sample = sample_from_plaid(&plaid, 30, &mut rng);

        assert!(sample.len() <= 30);
        let unique: FxHashSet<usize> = sample.iter().cloned().collect();
        assert_eq!(unique.len(), sample.len());
        assert!(sample.iter().all(|&i| i < 100));
    }

    #[test]
    fn test_sample_never_exceeds_population() {
        let plaid = vec![0, 0, 1, 1, 2];
        let mut rng = StdRng::seed_from_u64(2);
        let sample = sample_from_plaid(&plaid, 50, &mut rng);
        assert_eq!(sample.len(), 5);
    }

    #[test]
    fn test_rare_population_kept() {
        // 5% of cells sit in a distant blob; equal-share draws keep them
        let emb = two_blob_embedding(950, 50);
        let plaid = compute_plaid(emb.as_ref(), 40).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        let sample = sample_from_plaid(&plaid, 100, &mut rng);
        let n_minor = sample.iter().filter(|&&i| i >= 950).count();

        // uniform sampling would expect ~5; stratified draws far more
        assert!(n_minor >= 10);
    }

    #[test]
    fn test_independent_draws_share_plaid() {
        let emb = two_blob_embedding(95, 5);
        let plaid = compute_plaid(emb.as_ref(), 20).unwrap();

        let mut rng1 = StdRng::seed_from_u64(7);
        let mut rng2 = StdRng::seed_from_u64(7);
        let a = sample_from_plaid(&plaid, 25, &mut rng1);
        let b = sample_from_plaid(&plaid, 25, &mut rng2);

        assert_eq!(a, b);
    }
}

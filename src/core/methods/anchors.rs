use faer::{Mat, MatRef};
use log::{info, warn};
use rayon::prelude::*;

use crate::core::base::likelihood::{
    nb_loglik_matrix, nb_loglik_null, signal_per_cell,
};
use crate::core::base::stats::cosine_to_profiles;
use crate::utils::general::which_max;

////////////
// Params //
////////////

/// Parameters controlling anchor cell selection
///
/// ### Fields
///
/// * `n_anchor_cells` - Maximum number of anchors retained per cell type
/// * `min_cosine` - Minimum cosine similarity between a cell's counts and
///   the best-matching reference profile
/// * `min_llr` - Minimum per-count log-likelihood gain of the best profile
///   over the background-only model
/// * `insufficient_anchors_thresh` - Types retaining fewer anchors than this
///   are dropped from the anchor set
#[derive(Clone, Debug)]
pub struct AnchorParams {
    pub n_anchor_cells: usize,
    pub min_cosine: f64,
    pub min_llr: f64,
    pub insufficient_anchors_thresh: usize,
}

impl Default for AnchorParams {
    fn default() -> Self {
        AnchorParams {
            n_anchor_cells: 2000,
            min_cosine: 0.3,
            min_llr: 0.03,
            insufficient_anchors_thresh: 20,
        }
    }
}

////////////////////
// Main functions //
////////////////////

/// Select high-confidence anchor cells for each reference type
///
/// A cell qualifies for its best-matching type when its cosine similarity to
/// that profile and its scaled log-likelihood ratio over pure background both
/// clear the configured thresholds. Per type, the strongest `n_anchor_cells`
/// qualifiers are kept (scaled LLR descending, cell index as tie-break).
/// Types left with fewer than `insufficient_anchors_thresh` anchors are
/// dropped entirely with a warning.
///
/// ### Params
///
/// * `counts` - Counts matrix (cells x genes)
/// * `totals` - Total counts per cell
/// * `bg` - Background level per cell
/// * `profiles` - Reference profile matrix (genes x types)
/// * `type_names` - Display names of the reference types
/// * `size` - The size parameter of the negative binomial
/// * `params` - Anchor selection parameters
///
/// ### Returns
///
/// Per-cell anchor assignment as a type index, `None` for non-anchors.
pub fn find_anchor_cells(
    counts: MatRef<f64>,
    totals: &[f64],
    bg: &[f64],
    profiles: MatRef<f64>,
    type_names: &[String],
    size: f64,
    params: &AnchorParams,
) -> Result<Vec<Option<usize>>, String> {
    let n_cells = counts.nrows();
    let n_types = profiles.ncols();
    if type_names.len() != n_types {
        return Err(format!(
            "Expected {} type names, got {}",
            n_types,
            type_names.len()
        ));
    }

    let signal = signal_per_cell(totals, bg, counts.ncols());
    let logliks = nb_loglik_matrix(counts, profiles, &signal, bg, size);
    let null_logliks = nb_loglik_null(counts, bg, size);
    let sims = cosine_to_profiles(counts, profiles);

    // qualifying candidates: (type, scaled llr) per cell
    let candidates: Vec<Option<(usize, f64)>> = (0..n_cells)
        .into_par_iter()
        .map(|i| {
            let lls: Vec<f64> = logliks.row(i).iter().cloned().collect();
            let best = which_max(&lls);
            let scaled_llr = (lls[best] - null_logliks[i]) / totals[i];
            if sims[(i, best)] >= params.min_cosine && scaled_llr >= params.min_llr {
                Some((best, scaled_llr))
            } else {
                None
            }
        })
        .collect();

    let mut per_type: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n_types];
    for (cell, cand) in candidates.iter().enumerate() {
        if let Some((t, llr)) = cand {
            per_type[*t].push((cell, *llr));
        }
    }

    let mut anchors: Vec<Option<usize>> = vec![None; n_cells];
    let mut dropped: Vec<&String> = Vec::new();
    let mut n_anchors = 0;
    for (t, cands) in per_type.iter_mut().enumerate() {
        cands.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        cands.truncate(params.n_anchor_cells);

        if cands.len() < params.insufficient_anchors_thresh {
            dropped.push(&type_names[t]);
            continue;
        }
        for &(cell, _) in cands.iter() {
            anchors[cell] = Some(t);
            n_anchors += 1;
        }
    }

    if !dropped.is_empty() {
        warn!(
            "Insufficient anchors for cell type(s) {:?}; dropping them from the anchor set",
            dropped
        );
    }
    info!("Selected {} anchor cells", n_anchors);

    Ok(anchors)
}

/// Recompute reference profiles from anchor cells
///
/// Each type with at least one anchor gets its profile column replaced by
/// the anchor cells' summed counts over their summed signal scale; types
/// without anchors keep the supplied column.
///
/// ### Params
///
/// * `counts` - Counts matrix (cells x genes)
/// * `signal` - Signal scale per cell
/// * `anchors` - Per-cell anchor type index
/// * `profiles` - Supplied reference profile matrix (genes x types)
///
/// ### Returns
///
/// The updated profile matrix.
pub fn update_reference_profiles(
    counts: MatRef<f64>,
    signal: &[f64],
    anchors: &[Option<usize>],
    profiles: MatRef<f64>,
) -> Mat<f64> {
    let n_genes = counts.ncols();
    let n_types = profiles.ncols();

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); n_types];
    for (cell, anchor) in anchors.iter().enumerate() {
        if let Some(t) = anchor {
            members[*t].push(cell);
        }
    }

    let cols: Vec<Vec<f64>> = (0..n_types)
        .into_par_iter()
        .map(|t| {
            if members[t].is_empty() {
                return profiles.col(t).iter().cloned().collect();
            }
            let mut num = vec![0.0; n_genes];
            let mut den = 0.0;
            for &cell in &members[t] {
                den += signal[cell];
                for g in 0..n_genes {
                    num[g] += counts[(cell, g)];
                }
            }
            for val in num.iter_mut() {
                *val /= den;
            }
            num
        })
        .collect();

    Mat::from_fn(n_genes, n_types, |g, t| cols[t][g])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::generate_cell_mixture;

    #[test]
    fn test_anchors_found_on_clean_data() {
        let sim = generate_cell_mixture(200, 40, 2, 10.0, 42);
        let totals: Vec<f64> =
            (0..200).map(|i| sim.counts.row(i).iter().sum()).collect();
        let bg = vec![0.1; 200];

        let params = AnchorParams {
            n_anchor_cells: 50,
            min_cosine: 0.2,
            min_llr: 0.01,
            insufficient_anchors_thresh: 5,
        };
        let anchors = find_anchor_cells(
            sim.counts.as_ref(),
            &totals,
            &bg,
            sim.profiles.as_ref(),
            &["t0".to_string(), "t1".to_string()],
            10.0,
            &params,
        )
        .unwrap();

        let n_anchored = anchors.iter().filter(|a| a.is_some()).count();
        assert!(n_anchored > 0);
        assert!(n_anchored <= 100);

        // anchors agree with the simulated ground truth
        for (cell, anchor) in anchors.iter().enumerate() {
            if let Some(t) = anchor {
                assert_eq!(*t, sim.labels[cell]);
            }
        }
    }

    #[test]
    fn test_insufficient_anchors_drop_type() {
        let sim = generate_cell_mixture(100, 30, 2, 10.0, 7);
        let totals: Vec<f64> =
            (0..100).map(|i| sim.counts.row(i).iter().sum()).collect();
        let bg = vec![0.1; 100];

        // threshold above anything attainable for the capped type
        let params = AnchorParams {
            n_anchor_cells: 3,
            min_cosine: 0.2,
            min_llr: 0.01,
            insufficient_anchors_thresh: 10,
        };
        let anchors = find_anchor_cells(
            sim.counts.as_ref(),
            &totals,
            &bg,
            sim.profiles.as_ref(),
            &["t0".to_string(), "t1".to_string()],
            10.0,
            &params,
        )
        .unwrap();

        assert!(anchors.iter().all(|a| a.is_none()));
    }

    #[test]
    fn test_update_reference_profiles_uses_anchors() {
        let sim = generate_cell_mixture(150, 25, 2, 10.0, 11);
        let totals: Vec<f64> =
            (0..150).map(|i| sim.counts.row(i).iter().sum()).collect();
        let bg = vec![0.0; 150];
        let signal = signal_per_cell(&totals, &bg, 25);

        let anchors: Vec<Option<usize>> = sim.labels.iter().map(|&l| Some(l)).collect();
        let updated = update_reference_profiles(
            sim.counts.as_ref(),
            &signal,
            &anchors,
            sim.profiles.as_ref(),
        );

        assert_eq!(updated.nrows(), 25);
        assert_eq!(updated.ncols(), 2);
        // updated profiles correlate with the generating ones: the top marker
        // gene of each type stays its top gene
        for t in 0..2 {
            let true_col: Vec<f64> = sim.profiles.col(t).iter().cloned().collect();
            let new_col: Vec<f64> = updated.col(t).iter().cloned().collect();
            assert_eq!(which_max(&true_col), which_max(&new_col));
        }
    }
}

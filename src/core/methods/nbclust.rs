use faer::{Mat, MatRef};
use log::warn;
use rand::prelude::*;
use rayon::prelude::*;

use crate::core::base::likelihood::{nb_loglik_matrix, signal_per_cell, to_posterior};
use crate::core::base::utils::row_sums;
use crate::utils::general::which_max;

// consecutive empty iterations before a free cluster is reseeded (and, after
// one failed reseed, pruned)
const EMPTY_CLUSTER_PATIENCE: usize = 2;

///////////
// Enums //
///////////

/// Assignment flavour of the iterative fit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterMethod {
    /// Hard assignments: each cell contributes only to its best cluster
    Em,
    /// Soft assignments: cells contribute posterior-weighted to all clusters
    Sem,
}

/// Helper function to get the clustering method
///
/// ### Params
///
/// * `s` - String, type of clustering to run.
///
/// ### Returns
///
/// Option of the `ClusterMethod`
pub fn parse_cluster_method(s: &str) -> Option<ClusterMethod> {
    match s.to_lowercase().as_str() {
        "em" => Some(ClusterMethod::Em),
        "sem" => Some(ClusterMethod::Sem),
        _ => None,
    }
}

/// How the free clusters are seeded
#[derive(Clone, Debug)]
pub enum ClusterInit {
    /// Per-cell initial cluster indices over the full cluster space
    Labels(Vec<usize>),
    /// Initial profiles for the free clusters (genes x free clusters)
    Profiles(Mat<f64>),
    /// Seeded shuffle, then cyclic assignment over the free clusters
    RoundRobin,
}

////////////////////////
// Params and results //
////////////////////////

/// Structure that stores the mixture engine parameters
///
/// ### Fields
///
/// * `method` - Hard (EM) or soft (SEM) assignment updates
/// * `nb_size` - The size parameter of the negative binomial
/// * `pct_drop` - Relative plateau criterion: converged once the fraction of
///   validly switching cells falls below `pct_drop` times the previous
///   iteration's fraction
/// * `min_prob_increase` - A switch only counts when the cell's best
///   posterior rose by at least this much
/// * `max_iters` - Iteration cap
#[derive(Clone, Debug)]
pub struct NbClustParams {
    pub method: ClusterMethod,
    pub nb_size: f64,
    pub pct_drop: f64,
    pub min_prob_increase: f64,
    pub max_iters: usize,
}

impl Default for NbClustParams {
    fn default() -> Self {
        NbClustParams {
            method: ClusterMethod::Em,
            nb_size: 10.0,
            pct_drop: 0.1,
            min_prob_increase: 0.05,
            max_iters: 40,
        }
    }
}

/// Result structure of one mixture engine run
///
/// ### Fields
///
/// * `profiles` - Fitted profile matrix (genes x clusters), fixed clusters
///   first; pruned clusters are dropped
/// * `assignment` - Hard cluster index per cell
/// * `posterior` - Posterior probability matrix (cells x clusters)
/// * `logliks` - Log-likelihood matrix (cells x clusters)
/// * `pct_changed` - Per-iteration fraction of validly switching cells
/// * `converged` - Whether the plateau criterion fired before `max_iters`
/// * `kept_clusters` - Original cluster indices surviving pruning
#[derive(Clone, Debug)]
pub struct NbClustResult {
    pub profiles: Mat<f64>,
    pub assignment: Vec<usize>,
    pub posterior: Mat<f64>,
    pub logliks: Mat<f64>,
    pub pct_changed: Vec<f64>,
    pub converged: bool,
    pub kept_clusters: Vec<usize>,
}

/////////////
// Helpers //
/////////////

/// One-hot weight matrix from hard assignments
fn hard_weights(assignment: &[usize], n_clusts: usize) -> Mat<f64> {
    Mat::from_fn(assignment.len(), n_clusts, |i, j| {
        if assignment[i] == j {
            1.0
        } else {
            0.0
        }
    })
}

/// Posterior weights with anchored rows forced one-hot
fn soft_weights(posterior: &Mat<f64>, anchors: Option<&[Option<usize>]>) -> Mat<f64> {
    let mut weights = posterior.clone();
    if let Some(anchors) = anchors {
        for (i, anchor) in anchors.iter().enumerate() {
            if let Some(t) = anchor {
                for j in 0..weights.ncols() {
                    weights[(i, j)] = 0.0;
                }
                weights[(i, *t)] = 1.0;
            }
        }
    }
    weights
}

/// M-step: refit the free, live cluster profiles from weighted counts
///
/// Each free column becomes the weighted count sums over the weighted signal
/// sums. Columns whose weight mass vanished keep their previous profile.
fn update_free_profiles(
    counts: MatRef<f64>,
    signal: &[f64],
    weights: MatRef<f64>,
    n_fixed: usize,
    dead: &[bool],
    profiles: &mut Mat<f64>,
) {
    let n_genes = counts.ncols();

    let free_cols: Vec<(usize, Option<Vec<f64>>)> = (n_fixed..weights.ncols())
        .into_par_iter()
        .map(|j| {
            if dead[j] {
                return (j, None);
            }
            let mut num = vec![0.0; n_genes];
            let mut den = 0.0;
            for i in 0..counts.nrows() {
                let w = weights[(i, j)];
                if w < 1e-10 {
                    continue;
                }
                den += w * signal[i];
                for g in 0..n_genes {
                    num[g] += w * counts[(i, g)];
                }
            }
            if den < 1e-12 {
                return (j, None);
            }
            for val in num.iter_mut() {
                *val /= den;
            }
            (j, Some(num))
        })
        .collect();

    for (j, col) in free_cols {
        if let Some(col) = col {
            for g in 0..n_genes {
                profiles[(g, j)] = col[g];
            }
        }
    }
}

/// Log-likelihood matrix over the live clusters, `-inf` for pruned columns
fn loglik_live(
    counts: MatRef<f64>,
    profiles: &Mat<f64>,
    signal: &[f64],
    bg: &[f64],
    size: f64,
    dead: &[bool],
) -> Mat<f64> {
    if !dead.iter().any(|&d| d) {
        return nb_loglik_matrix(counts, profiles.as_ref(), signal, bg, size);
    }

    let live: Vec<usize> = (0..profiles.ncols()).filter(|&j| !dead[j]).collect();
    let sub = Mat::from_fn(profiles.nrows(), live.len(), |g, jj| {
        profiles[(g, live[jj])]
    });
    let ll_sub = nb_loglik_matrix(counts, sub.as_ref(), signal, bg, size);

    let mut logliks = Mat::from_fn(counts.nrows(), profiles.ncols(), |_, _| f64::NEG_INFINITY);
    for (jj, &j) in live.iter().enumerate() {
        for i in 0..counts.nrows() {
            logliks[(i, j)] = ll_sub[(i, jj)];
        }
    }
    logliks
}

/// Deterministic reseed of an emptied free cluster from the worst-fit cells
fn reseed_profile(
    counts: MatRef<f64>,
    signal: &[f64],
    best_prob: &[f64],
    n_clusts: usize,
    cluster: usize,
    profiles: &mut Mat<f64>,
) {
    let n_cells = counts.nrows();
    let n_genes = counts.ncols();

    let mut order: Vec<usize> = (0..n_cells).collect();
    order.sort_by(|&a, &b| best_prob[a].total_cmp(&best_prob[b]).then(a.cmp(&b)));
    let n_seed = (n_cells / (n_clusts * 10)).max(1).min(n_cells);

    let mut num = vec![0.0; n_genes];
    let mut den = 0.0;
    for &cell in order.iter().take(n_seed) {
        den += signal[cell];
        for g in 0..n_genes {
            num[g] += counts[(cell, g)];
        }
    }
    for g in 0..n_genes {
        profiles[(g, cluster)] = num[g] / den;
    }
}

////////////////////
// Main functions //
////////////////////

/// Iterative negative binomial mixture fit on one set of cells
///
/// Alternates E-steps (log-likelihood of every cell against every live
/// cluster profile, turned into posteriors and hard assignments) and M-steps
/// (refitting free cluster profiles from the weighted counts) until the
/// relative plateau criterion fires or `max_iters` is reached.
///
/// Fixed profiles occupy the first cluster columns and are never updated.
/// Anchored cells never change assignment and always contribute to their
/// anchored cluster's profile. A free cluster left empty for two consecutive
/// iterations is reseeded once from the worst-fitting cells; a second
/// collapse prunes it from the output.
///
/// ### Params
///
/// * `counts` - Counts matrix (cells x genes)
/// * `bg` - Background level per cell
/// * `n_free_clusts` - Number of clusters to estimate freely
/// * `fixed_profiles` - Profiles held fixed throughout (genes x fixed)
/// * `anchors` - Per-cell anchored cluster index over the full cluster space
/// * `init` - How the free clusters are seeded
/// * `params` - Engine parameters
/// * `seed` - Seed for the round-robin initialisation shuffle
///
/// ### Returns
///
/// The `NbClustResult` of the converged (or capped) fit.
#[allow(clippy::too_many_arguments)]
pub fn nbclust(
    counts: MatRef<f64>,
    bg: &[f64],
    n_free_clusts: usize,
    fixed_profiles: Option<MatRef<f64>>,
    anchors: Option<&[Option<usize>]>,
    init: ClusterInit,
    params: &NbClustParams,
    seed: u64,
) -> Result<NbClustResult, String> {
    let n_cells = counts.nrows();
    let n_genes = counts.ncols();
    let n_fixed = fixed_profiles.map_or(0, |p| p.ncols());
    let n_clusts = n_fixed + n_free_clusts;

    if n_cells == 0 {
        return Err("Cannot cluster an empty counts matrix".to_string());
    }
    if n_clusts == 0 {
        return Err("At least one cluster (fixed or free) is required".to_string());
    }
    if params.max_iters == 0 {
        return Err("max_iters must be positive".to_string());
    }
    if bg.len() != n_cells {
        return Err(format!(
            "Background length {} does not match cell count {}",
            bg.len(),
            n_cells
        ));
    }
    if let Some(fp) = fixed_profiles {
        if fp.nrows() != n_genes {
            return Err(format!(
                "Fixed profiles have {} genes but counts has {}",
                fp.nrows(),
                n_genes
            ));
        }
    }
    if let Some(anchors) = anchors {
        if anchors.len() != n_cells {
            return Err(format!(
                "Anchor vector length {} does not match cell count {}",
                anchors.len(),
                n_cells
            ));
        }
        if let Some(bad) = anchors.iter().flatten().find(|&&t| t >= n_clusts) {
            return Err(format!(
                "Anchor cluster index {} out of range for {} clusters",
                bad, n_clusts
            ));
        }
    }

    let totals = row_sums(counts);
    if let Some(i) = totals.iter().position(|&t| t <= 0.0) {
        return Err(format!("Cell {} has zero total counts", i));
    }
    let signal = signal_per_cell(&totals, bg, n_genes);

    // seed the profile matrix: fixed columns first, then the free clusters
    let mut profiles: Mat<f64> = Mat::zeros(n_genes, n_clusts);
    if let Some(fp) = fixed_profiles {
        for j in 0..n_fixed {
            for g in 0..n_genes {
                profiles[(g, j)] = fp[(g, j)];
            }
        }
    }

    let no_dead = vec![false; n_clusts];
    match init {
        ClusterInit::Profiles(free) => {
            if free.nrows() != n_genes || free.ncols() != n_free_clusts {
                return Err(format!(
                    "Initial profiles are {}x{}, expected {}x{}",
                    free.nrows(),
                    free.ncols(),
                    n_genes,
                    n_free_clusts
                ));
            }
            for j in 0..n_free_clusts {
                for g in 0..n_genes {
                    profiles[(g, n_fixed + j)] = free[(g, j)];
                }
            }
        }
        ClusterInit::Labels(labels) => {
            if labels.len() != n_cells {
                return Err(format!(
                    "Initial label length {} does not match cell count {}",
                    labels.len(),
                    n_cells
                ));
            }
            if let Some(bad) = labels.iter().find(|&&l| l >= n_clusts) {
                return Err(format!(
                    "Initial cluster index {} out of range for {} clusters",
                    bad, n_clusts
                ));
            }
            let mut assignment = labels;
            if let Some(anchors) = anchors {
                for (i, anchor) in anchors.iter().enumerate() {
                    if let Some(t) = anchor {
                        assignment[i] = *t;
                    }
                }
            }
            let weights = hard_weights(&assignment, n_clusts);
            update_free_profiles(counts, &signal, weights.as_ref(), n_fixed, &no_dead, &mut profiles);
        }
        ClusterInit::RoundRobin => {
            if n_free_clusts > 0 {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut order: Vec<usize> = (0..n_cells).collect();
                order.shuffle(&mut rng);

                let mut assignment = vec![0usize; n_cells];
                let mut pos = 0;
                for &i in &order {
                    match anchors.and_then(|a| a[i]) {
                        Some(t) => assignment[i] = t,
                        None => {
                            assignment[i] = n_fixed + pos % n_free_clusts;
                            pos += 1;
                        }
                    }
                }
                let weights = hard_weights(&assignment, n_clusts);
                update_free_profiles(counts, &signal, weights.as_ref(), n_fixed, &no_dead, &mut profiles);
            }
        }
    }

    let mut dead = vec![false; n_clusts];
    let mut empty_streak = vec![0usize; n_clusts];
    let mut reseeded = vec![false; n_clusts];

    let mut prev_assignment: Option<Vec<usize>> = None;
    let mut prev_best_prob = vec![0.0; n_cells];
    let mut pct_changed: Vec<f64> = Vec::new();
    let mut converged = false;

    let mut logliks: Mat<f64> = Mat::zeros(n_cells, n_clusts);
    let mut posterior: Mat<f64> = Mat::zeros(n_cells, n_clusts);
    let mut assignment = vec![0usize; n_cells];

    for iter in 0..params.max_iters {
        // E-step
        logliks = loglik_live(counts, &profiles, &signal, bg, params.nb_size, &dead);
        posterior = to_posterior(logliks.as_ref())?;
        assignment = (0..n_cells)
            .into_par_iter()
            .map(|i| {
                let row: Vec<f64> = posterior.row(i).iter().cloned().collect();
                which_max(&row)
            })
            .collect();
        if let Some(anchors) = anchors {
            for (i, anchor) in anchors.iter().enumerate() {
                if let Some(t) = anchor {
                    assignment[i] = *t;
                }
            }
        }
        let best_prob: Vec<f64> = (0..n_cells).map(|i| posterior[(i, assignment[i])]).collect();

        // relative plateau criterion against the previous iteration
        let frac = match &prev_assignment {
            None => 1.0,
            Some(prev) => {
                let changed = (0..n_cells)
                    .filter(|&i| {
                        assignment[i] != prev[i]
                            && best_prob[i] - prev_best_prob[i] >= params.min_prob_increase
                    })
                    .count();
                changed as f64 / n_cells as f64
            }
        };
        let prev_frac = pct_changed.last().copied();
        pct_changed.push(frac);
        if prev_assignment.is_some() {
            if frac == 0.0 {
                converged = true;
            } else if let Some(pf) = prev_frac {
                if frac < params.pct_drop * pf {
                    converged = true;
                }
            }
        }
        prev_assignment = Some(assignment.clone());
        prev_best_prob = best_prob.clone();

        if converged || iter == params.max_iters - 1 {
            break;
        }

        // empty-cluster recovery on the free clusters
        let mut members = vec![0usize; n_clusts];
        for &a in &assignment {
            members[a] += 1;
        }
        for j in n_fixed..n_clusts {
            if dead[j] {
                continue;
            }
            if members[j] == 0 {
                empty_streak[j] += 1;
            } else {
                empty_streak[j] = 0;
            }
            if empty_streak[j] >= EMPTY_CLUSTER_PATIENCE {
                if !reseeded[j] {
                    reseed_profile(counts, &signal, &best_prob, n_clusts, j, &mut profiles);
                    reseeded[j] = true;
                    empty_streak[j] = 0;
                } else {
                    warn!("Pruning cluster {} after a failed reseed", j);
                    dead[j] = true;
                }
            }
        }
        if dead.iter().filter(|&&d| d).count() == n_clusts {
            return Err(
                "No usable clusters remain after empty-cluster recovery".to_string(),
            );
        }

        // M-step
        let weights = match params.method {
            ClusterMethod::Em => hard_weights(&assignment, n_clusts),
            ClusterMethod::Sem => soft_weights(&posterior, anchors),
        };
        update_free_profiles(counts, &signal, weights.as_ref(), n_fixed, &dead, &mut profiles);
    }

    // drop pruned clusters from every output
    let kept_clusters: Vec<usize> = (0..n_clusts).filter(|&j| !dead[j]).collect();
    if kept_clusters.len() < n_clusts {
        let mut old_to_new = vec![usize::MAX; n_clusts];
        for (new, &old) in kept_clusters.iter().enumerate() {
            old_to_new[old] = new;
        }
        profiles = Mat::from_fn(n_genes, kept_clusters.len(), |g, jj| {
            profiles[(g, kept_clusters[jj])]
        });
        logliks = Mat::from_fn(n_cells, kept_clusters.len(), |i, jj| {
            logliks[(i, kept_clusters[jj])]
        });
        posterior = Mat::from_fn(n_cells, kept_clusters.len(), |i, jj| {
            posterior[(i, kept_clusters[jj])]
        });
        assignment = assignment.into_iter().map(|a| old_to_new[a]).collect();
    }

    Ok(NbClustResult {
        profiles,
        assignment,
        posterior,
        logliks,
        pct_changed,
        converged,
        kept_clusters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::generate_cell_mixture;

    fn purity(assignment: &[usize], truth: &[usize]) -> f64 {
        // best of the two possible label mappings for two clusters
        let n = assignment.len() as f64;
        let same = assignment
            .iter()
            .zip(truth.iter())
            .filter(|(a, t)| a == t)
            .count() as f64;
        (same / n).max(1.0 - same / n)
    }

    #[test]
    fn test_two_cluster_recovery() {
        let sim = generate_cell_mixture(500, 50, 2, 10.0, 42);
        let bg = vec![0.1; 500];

        let res = nbclust(
            sim.counts.as_ref(),
            &bg,
            2,
            None,
            None,
            ClusterInit::RoundRobin,
            &NbClustParams::default(),
            9,
        )
        .unwrap();

        assert!(purity(&res.assignment, &sim.labels) >= 0.95);
        assert!(res.pct_changed.len() <= NbClustParams::default().max_iters);
    }

    #[test]
    fn test_posterior_rows_sum_to_one() {
        let sim = generate_cell_mixture(120, 30, 3, 10.0, 3);
        let bg = vec![0.1; 120];

        let res = nbclust(
            sim.counts.as_ref(),
            &bg,
            3,
            None,
            None,
            ClusterInit::RoundRobin,
            &NbClustParams::default(),
            4,
        )
        .unwrap();

        for i in 0..120 {
            let row_sum: f64 = res.posterior.row(i).iter().sum();
            assert!((row_sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_anchors_never_reassigned() {
        let sim = generate_cell_mixture(200, 40, 2, 10.0, 17);
        let bg = vec![0.1; 200];

        // deliberately anchor 20 cells, half of them against their own truth
        let mut anchors: Vec<Option<usize>> = vec![None; 200];
        for i in 0..20 {
            anchors[i] = Some(i % 2);
        }
        // anchors address the fixed cluster space
        let fixed = sim.profiles.clone();

        let res = nbclust(
            sim.counts.as_ref(),
            &bg,
            0,
            Some(fixed.as_ref()),
            Some(&anchors),
            ClusterInit::RoundRobin,
            &NbClustParams::default(),
            5,
        )
        .unwrap();

        for i in 0..20 {
            assert_eq!(res.assignment[i], i % 2);
        }
    }

    #[test]
    fn test_fixed_profiles_not_updated() {
        let sim = generate_cell_mixture(150, 25, 2, 10.0, 23);
        let bg = vec![0.1; 150];
        let fixed = sim.profiles.clone();

        let res = nbclust(
            sim.counts.as_ref(),
            &bg,
            1,
            Some(fixed.as_ref()),
            None,
            ClusterInit::RoundRobin,
            &NbClustParams::default(),
            6,
        )
        .unwrap();

        // the fixed columns come back untouched
        for t in 0..2 {
            for g in 0..25 {
                assert_eq!(res.profiles[(g, t)], fixed[(g, t)]);
            }
        }
    }

    #[test]
    fn test_trace_starts_at_one_and_terminates() {
        let sim = generate_cell_mixture(100, 20, 2, 10.0, 31);
        let bg = vec![0.1; 100];

        let params = NbClustParams {
            max_iters: 8,
            ..Default::default()
        };
        let res = nbclust(
            sim.counts.as_ref(),
            &bg,
            2,
            None,
            None,
            ClusterInit::RoundRobin,
            &params,
            2,
        )
        .unwrap();

        assert_eq!(res.pct_changed[0], 1.0);
        assert!(res.pct_changed.len() <= 8);
    }

    #[test]
    fn test_zero_count_cell_rejected() {
        let counts: Mat<f64> = Mat::zeros(5, 4);
        let bg = vec![0.1; 5];

        let res = nbclust(
            counts.as_ref(),
            &bg,
            2,
            None,
            None,
            ClusterInit::RoundRobin,
            &NbClustParams::default(),
            1,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_labels_init_converges_fast_on_truth() {
        let sim = generate_cell_mixture(200, 30, 2, 10.0, 13);
        let bg = vec![0.1; 200];

        let res = nbclust(
            sim.counts.as_ref(),
            &bg,
            2,
            None,
            None,
            ClusterInit::Labels(sim.labels.clone()),
            &NbClustParams::default(),
            1,
        )
        .unwrap();

        assert!(res.converged);
        let same = res
            .assignment
            .iter()
            .zip(sim.labels.iter())
            .filter(|(a, t)| a == t)
            .count();
        assert!(same as f64 / 200.0 >= 0.95);
    }
}

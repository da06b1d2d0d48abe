use faer::{Mat, MatRef};
use log::{info, warn};
use rand::prelude::*;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::core::base::likelihood::{
    nb_loglik_matrix, signal_per_cell, to_posterior, total_best_loglik,
};
use crate::core::base::pca_svd::log_pca_scores;
use crate::core::base::stats::fit_background;
use crate::core::base::utils::{normalise_matrix_col_sum, row_sums};
use crate::core::methods::anchors::{
    find_anchor_cells, update_reference_profiles, AnchorParams,
};
use crate::core::methods::choose_clusters::choose_cluster_number;
use crate::core::methods::nbclust::{
    nbclust, ClusterInit, ClusterMethod, NbClustParams, NbClustResult,
};
use crate::core::methods::sketch::{compute_plaid, sample_from_plaid};
use crate::utils::general::which_max;

///////////
// Enums //
///////////

/// Requested number of free clusters
#[derive(Clone, Copy, Debug)]
pub enum ClusterCount {
    /// No free clusters: classify directly against the reference profiles
    Supervised,
    /// A fixed number of free clusters (0 behaves like `Supervised`)
    Fixed(usize),
    /// Sweep the inclusive range and pick the best-scoring count
    Range(usize, usize),
}

/// Free-cluster seed carried into the refinement phase
enum Phase2Seed {
    Labels(Vec<usize>),
    Profiles(Mat<f64>),
}

////////////////////////
// Params and results //
////////////////////////

/// Externally supplied reference profiles
///
/// ### Fields
///
/// * `profiles` - Expected expression per type (genes x types)
/// * `gene_names` - Gene names parallel to the profile rows
/// * `type_names` - Display names of the cell types
#[derive(Clone, Copy, Debug)]
pub struct ReferenceProfiles<'a> {
    pub profiles: MatRef<'a, f64>,
    pub gene_names: &'a [String],
    pub type_names: &'a [String],
}

/// Input data of one cell typing run
///
/// ### Fields
///
/// * `counts` - Counts matrix (cells x genes), every row sum positive
/// * `gene_names` - Gene names parallel to the counts columns
/// * `bg` - Expected background per cell and gene, if known
/// * `negmean` - Mean negative probe count per cell; used to fit the
///   background when `bg` is absent
/// * `cohort` - Per-cell cohort labels for the frequency prior
/// * `anchors` - Per-cell fixed type labels; `None` entries are free
/// * `init_clust` - Per-cell initial cluster labels; skips the multi-start
///   phase when supplied
/// * `reference` - Reference profiles for the supervised/semi-supervised
///   modes
/// * `embedding` - Low-dimensional embedding for the geometric binning;
///   computed internally when absent or mismatched
#[derive(Clone, Copy, Debug)]
pub struct InsituTypeInputs<'a> {
    pub counts: MatRef<'a, f64>,
    pub gene_names: &'a [String],
    pub bg: Option<&'a [f64]>,
    pub negmean: Option<&'a [f64]>,
    pub cohort: Option<&'a [String]>,
    pub anchors: Option<&'a [Option<String>]>,
    pub init_clust: Option<&'a [String]>,
    pub reference: Option<ReferenceProfiles<'a>>,
    pub embedding: Option<MatRef<'a, f64>>,
}

impl<'a> InsituTypeInputs<'a> {
    /// Minimal inputs: a counts matrix and its gene names
    pub fn new(counts: MatRef<'a, f64>, gene_names: &'a [String]) -> Self {
        InsituTypeInputs {
            counts,
            gene_names,
            bg: None,
            negmean: None,
            cohort: None,
            anchors: None,
            init_clust: None,
            reference: None,
            embedding: None,
        }
    }
}

/// Structure that stores the cell typing parameters
///
/// ### Fields
///
/// * `n_clusts` - Requested number of free clusters
/// * `method` - Hard (EM) or soft (SEM) assignment updates
/// * `align_genes` - Align counts and reference genes by name intersection
/// * `update_reference_profiles` - Refit the reference profiles from anchors
///   before clustering
/// * `nb_size` - The size parameter of the negative binomial
/// * `pct_drop` - Relative plateau convergence criterion
/// * `min_prob_increase` - Minimum posterior gain for a valid switch
/// * `max_iters` - Engine iteration cap
/// * `anchor` - Anchor selection parameters
/// * `n_starts` - Number of independent initialisations in phase 1
/// * `n_phase1` - Subset size per phase 1 start
/// * `n_phase2` - Subset size of the refinement phase
/// * `n_phase3` - Subset size of the final clustering phase
/// * `n_benchmark_cells` - Subset size for benchmarking the phase 1 starts
/// * `n_chooseclusternumber` - Subset size for the cluster-count sweep
/// * `n_pcs` - Principal components of the internal sketching embedding
/// * `seed` - Explicit seed; `None` draws a fresh one per run
#[derive(Clone, Debug)]
pub struct InsituTypeParams {
    pub n_clusts: ClusterCount,
    pub method: ClusterMethod,
    pub align_genes: bool,
    pub update_reference_profiles: bool,
    pub nb_size: f64,
    pub pct_drop: f64,
    pub min_prob_increase: f64,
    pub max_iters: usize,
    pub anchor: AnchorParams,
    pub n_starts: usize,
    pub n_phase1: usize,
    pub n_phase2: usize,
    pub n_phase3: usize,
    pub n_benchmark_cells: usize,
    pub n_chooseclusternumber: usize,
    pub n_pcs: usize,
    pub seed: Option<u64>,
}

impl Default for InsituTypeParams {
    fn default() -> Self {
        InsituTypeParams {
            n_clusts: ClusterCount::Fixed(10),
            method: ClusterMethod::Em,
            align_genes: true,
            update_reference_profiles: false,
            nb_size: 10.0,
            pct_drop: 0.1,
            min_prob_increase: 0.05,
            max_iters: 40,
            anchor: AnchorParams::default(),
            n_starts: 10,
            n_phase1: 10_000,
            n_phase2: 20_000,
            n_phase3: 100_000,
            n_benchmark_cells: 10_000,
            n_chooseclusternumber: 10_000,
            n_pcs: 20,
            seed: None,
        }
    }
}

/// Result structure of one cell typing run
///
/// ### Fields
///
/// * `clust` - Final cluster label per cell
/// * `prob` - Posterior probability of each cell's final cluster
/// * `posterior` - Posterior probability matrix (cells x clusters)
/// * `logliks` - Log-likelihood matrix (cells x clusters)
/// * `profiles` - Final profile matrix (genes x clusters); column-normalised
///   for clustering runs, the aligned reference profiles for supervised runs
/// * `cluster_names` - Display names parallel to the cluster columns
/// * `gene_names` - Gene names parallel to the profile rows after alignment
/// * `anchors` - The anchor set actually used, as type labels
#[derive(Clone, Debug)]
pub struct InsituTypeResult {
    pub clust: Vec<String>,
    pub prob: Vec<f64>,
    pub posterior: Mat<f64>,
    pub logliks: Mat<f64>,
    pub profiles: Mat<f64>,
    pub cluster_names: Vec<String>,
    pub gene_names: Vec<String>,
    pub anchors: Vec<Option<String>>,
}

/////////////
// Helpers //
/////////////

/// Copy a row subset of a matrix
fn subset_rows(mat: MatRef<f64>, idx: &[usize]) -> Mat<f64> {
    Mat::from_fn(idx.len(), mat.ncols(), |i, j| mat[(idx[i], j)])
}

/// Copy a subset of a slice
fn subset_vec<T: Clone>(v: &[T], idx: &[usize]) -> Vec<T> {
    idx.iter().map(|&i| v[i].clone()).collect()
}

/// Generated display names for free clusters: a, b, .., z, aa, ab, ..
fn free_cluster_names(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            if i < 26 {
                ((b'a' + i as u8) as char).to_string()
            } else {
                format!(
                    "{}{}",
                    (b'a' + (i / 26 - 1) as u8) as char,
                    (b'a' + (i % 26) as u8) as char
                )
            }
        })
        .collect()
}

/// Engine parameters derived from the orchestrator parameters
fn engine_params(params: &InsituTypeParams, pct_drop: f64) -> NbClustParams {
    NbClustParams {
        method: params.method,
        nb_size: params.nb_size,
        pct_drop,
        min_prob_increase: params.min_prob_increase,
        max_iters: params.max_iters,
    }
}

/// The free (non-fixed) profile columns of an engine result
fn free_profiles(fit: &NbClustResult, n_fixed: usize) -> Mat<f64> {
    let n_free = fit.profiles.ncols() - n_fixed;
    Mat::from_fn(fit.profiles.nrows(), n_free, |g, j| {
        fit.profiles[(g, n_fixed + j)]
    })
}

/// Carry cluster pruning into the free cluster names
fn prune_free_names(names: Vec<String>, fit: &NbClustResult, n_fixed: usize) -> Vec<String> {
    fit.kept_clusters
        .iter()
        .filter(|&&j| j >= n_fixed)
        .map(|&j| names[j - n_fixed].clone())
        .collect()
}

/// Align counts and reference profiles on their shared genes
///
/// Returns the (optional) column-subset counts matrix, the surviving gene
/// names in counts order, and the reference profiles reordered to match.
fn align_reference(
    counts: MatRef<f64>,
    gene_names: &[String],
    reference: &ReferenceProfiles,
    align_genes: bool,
) -> Result<(Option<Mat<f64>>, Vec<String>, Mat<f64>), String> {
    let n_types = reference.profiles.ncols();
    if reference.gene_names.len() != reference.profiles.nrows() {
        return Err(format!(
            "Reference profiles have {} rows but {} gene names",
            reference.profiles.nrows(),
            reference.gene_names.len()
        ));
    }
    if reference.type_names.len() != n_types {
        return Err(format!(
            "Reference profiles have {} columns but {} type names",
            n_types,
            reference.type_names.len()
        ));
    }

    if !align_genes {
        if gene_names != reference.gene_names {
            return Err(
                "Counts and reference genes differ and gene alignment is disabled".to_string(),
            );
        }
        return Ok((
            None,
            gene_names.to_vec(),
            reference.profiles.to_owned(),
        ));
    }

    let ref_rows: FxHashMap<&str, usize> = reference
        .gene_names
        .iter()
        .enumerate()
        .map(|(i, g)| (g.as_str(), i))
        .collect();

    let mut keep: Vec<(usize, usize)> = Vec::with_capacity(gene_names.len());
    let mut dropped: Vec<&String> = Vec::new();
    for (col, gene) in gene_names.iter().enumerate() {
        match ref_rows.get(gene.as_str()) {
            Some(&row) => keep.push((col, row)),
            None => dropped.push(gene),
        }
    }

    if keep.is_empty() {
        return Err("No overlapping genes between counts and reference profiles".to_string());
    }
    if !dropped.is_empty() {
        if dropped.len() <= 10 {
            warn!(
                "Dropping genes absent from the reference profiles: {:?}",
                dropped
            );
        } else {
            warn!(
                "Dropping {} of {} genes absent from the reference profiles",
                dropped.len(),
                gene_names.len()
            );
        }
    }
    let dropped_ref = reference.gene_names.len() - keep.len();
    if dropped_ref > 0 {
        warn!(
            "{} reference genes are not measured in the counts matrix",
            dropped_ref
        );
    }

    let kept_genes: Vec<String> = keep.iter().map(|&(col, _)| gene_names[col].clone()).collect();
    let aligned_profiles = Mat::from_fn(keep.len(), n_types, |jj, t| {
        reference.profiles[(keep[jj].1, t)]
    });
    let counts_sub = if dropped.is_empty() {
        None
    } else {
        Some(Mat::from_fn(counts.nrows(), keep.len(), |i, jj| {
            counts[(i, keep[jj].0)]
        }))
    };

    Ok((counts_sub, kept_genes, aligned_profiles))
}

/// Smoothed per-cohort cluster frequency log-priors
fn cohort_log_priors(
    cohort_ids: &[usize],
    n_cohorts: usize,
    source_cells: &[usize],
    source_assign: &[usize],
    n_clusts: usize,
) -> Vec<Vec<f64>> {
    let mut counts = vec![vec![0usize; n_clusts]; n_cohorts];
    let mut totals = vec![0usize; n_cohorts];
    for (pos, &cell) in source_cells.iter().enumerate() {
        let c = cohort_ids[cell];
        counts[c][source_assign[pos]] += 1;
        totals[c] += 1;
    }

    // add-one smoothing; cohorts unseen in the source fall out flat
    (0..n_cohorts)
        .map(|c| {
            (0..n_clusts)
                .map(|j| {
                    ((counts[c][j] + 1) as f64 / (totals[c] + n_clusts) as f64).ln()
                })
                .collect()
        })
        .collect()
}

/// Score every cell against the final profiles and assign labels
///
/// The full-dataset classification pass shared by the supervised and
/// clustering modes. Applies the cohort frequency prior when cohorts are
/// supplied and forces anchored cells onto their anchored cluster.
#[allow(clippy::too_many_arguments)]
fn classify_all(
    counts: MatRef<f64>,
    signal: &[f64],
    bg: &[f64],
    profiles_raw: MatRef<f64>,
    anchor_idx: Option<&[Option<usize>]>,
    cohort_ids: Option<&[usize]>,
    n_cohorts: usize,
    freq_source: Option<(&[usize], &[usize])>,
    nb_size: f64,
) -> Result<(Vec<usize>, Vec<f64>, Mat<f64>, Mat<f64>), String> {
    let n_cells = counts.nrows();
    let n_clusts = profiles_raw.ncols();

    let mut logliks = nb_loglik_matrix(counts, profiles_raw, signal, bg, nb_size);

    if let Some(cohort_ids) = cohort_ids {
        let (source_cells, source_assign): (Vec<usize>, Vec<usize>) = match freq_source {
            Some((cells, assign)) => (cells.to_vec(), assign.to_vec()),
            None => {
                // an unadjusted pass seeds the cohort frequencies
                let assign: Vec<usize> = (0..n_cells)
                    .into_par_iter()
                    .map(|i| {
                        let row: Vec<f64> = logliks.row(i).iter().cloned().collect();
                        which_max(&row)
                    })
                    .collect();
                ((0..n_cells).collect(), assign)
            }
        };
        let priors = cohort_log_priors(cohort_ids, n_cohorts, &source_cells, &source_assign, n_clusts);
        for i in 0..n_cells {
            let c = cohort_ids[i];
            for j in 0..n_clusts {
                logliks[(i, j)] += priors[c][j];
            }
        }
    }

    let posterior = to_posterior(logliks.as_ref())?;
    let mut assignment: Vec<usize> = (0..n_cells)
        .into_par_iter()
        .map(|i| {
            let row: Vec<f64> = posterior.row(i).iter().cloned().collect();
            which_max(&row)
        })
        .collect();
    if let Some(anchors) = anchor_idx {
        for (i, anchor) in anchors.iter().enumerate() {
            if let Some(t) = anchor {
                assignment[i] = *t;
            }
        }
    }
    let prob: Vec<f64> = (0..n_cells).map(|i| posterior[(i, assignment[i])]).collect();

    Ok((assignment, prob, posterior, logliks))
}

////////////////////
// Main functions //
////////////////////

/// Cell typing of a counts matrix via a negative binomial mixture
///
/// Drives the full pipeline: input validation, background resolution, gene
/// alignment against the reference profiles, anchor selection, geometric
/// binning of the embedding, optional cluster-count selection, multi-start
/// clustering on small subsets, refinement on growing subsets, and a final
/// classification of every cell against the fitted profiles.
///
/// With `ClusterCount::Supervised` (or `Fixed(0)`) and reference profiles,
/// the clustering phases are skipped entirely and cells are classified
/// directly against the supplied profiles.
///
/// ### Params
///
/// * `inputs` - Input data of the run
/// * `params` - Parameters of the run
///
/// ### Returns
///
/// The `InsituTypeResult` with per-cell labels, posteriors, the final
/// profile matrix and the anchor set used.
pub fn insitutype(
    inputs: &InsituTypeInputs,
    params: &InsituTypeParams,
) -> Result<InsituTypeResult, String> {
    let n_cells = inputs.counts.nrows();
    if n_cells == 0 {
        return Err("Counts matrix has no cells".to_string());
    }
    if inputs.gene_names.len() != inputs.counts.ncols() {
        return Err(format!(
            "Counts matrix has {} genes but {} gene names were supplied",
            inputs.counts.ncols(),
            inputs.gene_names.len()
        ));
    }
    for (name, len) in [
        ("bg", inputs.bg.map(|v| v.len())),
        ("negmean", inputs.negmean.map(|v| v.len())),
        ("cohort", inputs.cohort.map(|v| v.len())),
        ("anchors", inputs.anchors.map(|v| v.len())),
        ("init_clust", inputs.init_clust.map(|v| v.len())),
    ] {
        if let Some(len) = len {
            if len != n_cells {
                return Err(format!(
                    "Input '{}' has length {} but the counts matrix has {} cells",
                    name, len, n_cells
                ));
            }
        }
    }

    let supervised = matches!(
        params.n_clusts,
        ClusterCount::Supervised | ClusterCount::Fixed(0)
    );
    if supervised && inputs.reference.is_none() {
        return Err(
            "Cluster count 0 requested without reference profiles supplied".to_string(),
        );
    }
    if inputs.anchors.is_some() && inputs.reference.is_none() {
        return Err("Anchors supplied without reference profiles".to_string());
    }

    // gene alignment against the reference profiles
    let (counts_sub, gene_names, mut reference_profiles, type_names) = match &inputs.reference {
        Some(reference) => {
            let (counts_sub, genes, profiles) = align_reference(
                inputs.counts,
                inputs.gene_names,
                reference,
                params.align_genes,
            )?;
            (counts_sub, genes, Some(profiles), reference.type_names.to_vec())
        }
        None => (None, inputs.gene_names.to_vec(), None, Vec::new()),
    };
    let counts = counts_sub
        .as_ref()
        .map(|m| m.as_ref())
        .unwrap_or(inputs.counts);
    let n_genes = counts.ncols();

    let totals = row_sums(counts);
    let n_zero = totals.iter().filter(|&&t| t <= 0.0).count();
    if n_zero > 0 {
        let first = totals.iter().position(|&t| t <= 0.0).unwrap();
        return Err(format!(
            "{} cell(s) have zero total counts (first at row {}); remove them before cell typing",
            n_zero, first
        ));
    }

    // per-cell scaling and background resolution
    let mean_total = totals.iter().sum::<f64>() / n_cells as f64;
    let scaling: Vec<f64> = totals.iter().map(|&t| t / mean_total).collect();
    let bg: Vec<f64> = match (inputs.bg, inputs.negmean) {
        (Some(bg), _) => bg.to_vec(),
        (None, Some(negmean)) => fit_background(negmean, &scaling),
        (None, None) => vec![0.0; n_cells],
    };
    let signal = signal_per_cell(&totals, &bg, n_genes);

    let seed = params.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);

    // cohorts to dense ids
    let (cohort_ids, n_cohorts): (Option<Vec<usize>>, usize) = match inputs.cohort {
        Some(labels) => {
            let mut map: FxHashMap<&str, usize> = FxHashMap::default();
            let ids: Vec<usize> = labels
                .iter()
                .map(|l| {
                    let next = map.len();
                    *map.entry(l.as_str()).or_insert(next)
                })
                .collect();
            let n = map.len();
            (Some(ids), n)
        }
        None => (None, 0),
    };

    // anchor resolution and optional reference profile updating
    let mut anchor_idx: Option<Vec<Option<usize>>> = None;
    if let Some(profiles) = reference_profiles.clone() {
        let anchors = match inputs.anchors {
            Some(user) => {
                let name_to_idx: FxHashMap<&str, usize> = type_names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| (n.as_str(), i))
                    .collect();
                let mut mapped = Vec::with_capacity(n_cells);
                for label in user {
                    match label {
                        Some(l) => match name_to_idx.get(l.as_str()) {
                            Some(&t) => mapped.push(Some(t)),
                            None => {
                                return Err(format!(
                                    "Anchor label '{}' is not a reference type",
                                    l
                                ))
                            }
                        },
                        None => mapped.push(None),
                    }
                }
                mapped
            }
            None => find_anchor_cells(
                counts,
                &totals,
                &bg,
                profiles.as_ref(),
                &type_names,
                params.nb_size,
                &params.anchor,
            )?,
        };
        if params.update_reference_profiles {
            info!("Updating reference profiles from the anchor set");
            reference_profiles = Some(update_reference_profiles(
                counts,
                &signal,
                &anchors,
                profiles.as_ref(),
            ));
        }
        anchor_idx = Some(anchors);
    }
    let n_fixed = reference_profiles.as_ref().map_or(0, |p| p.ncols());

    // purely supervised: a single classification pass, profiles untouched
    if supervised {
        info!(
            "Supervised classification of {} cells against {} reference profiles",
            n_cells, n_fixed
        );
        let profiles_raw = reference_profiles.unwrap();
        let (assignment, prob, posterior, logliks) = classify_all(
            counts,
            &signal,
            &bg,
            profiles_raw.as_ref(),
            anchor_idx.as_deref(),
            cohort_ids.as_deref(),
            n_cohorts,
            None,
            params.nb_size,
        )?;
        let clust = assignment.iter().map(|&j| type_names[j].clone()).collect();
        let anchors_out = anchor_labels(anchor_idx, &type_names, n_cells);
        return Ok(InsituTypeResult {
            clust,
            prob,
            posterior,
            logliks,
            profiles: profiles_raw,
            cluster_names: type_names,
            gene_names,
            anchors: anchors_out,
        });
    }

    let fixed_view: Option<MatRef<f64>> = reference_profiles.as_ref().map(|m| m.as_ref());

    // sketching scaffold: embedding plus one plaid for the whole run
    let embedding: Mat<f64> = match inputs.embedding {
        Some(e) if e.nrows() == n_cells => e.to_owned(),
        Some(e) => {
            warn!(
                "Sketching embedding has {} rows but the counts matrix has {}; recomputing internally",
                e.nrows(),
                n_cells
            );
            log_pca_scores(counts, params.n_pcs, seed.wrapping_add(11))
        }
        None => log_pca_scores(counts, params.n_pcs, seed.wrapping_add(11)),
    };

    let p1 = params.n_phase1.clamp(1, n_cells);
    let p2 = params.n_phase2.clamp(1, n_cells);
    let p3 = params.n_phase3.clamp(1, n_cells);
    let pb = params.n_benchmark_cells.clamp(1, n_cells);
    let pc = params.n_chooseclusternumber.clamp(1, n_cells);
    let mut min_subset = p1.min(p2).min(p3).min(pb);
    if matches!(params.n_clusts, ClusterCount::Range(_, _)) {
        min_subset = min_subset.min(pc);
    }
    let plaid = compute_plaid(embedding.as_ref(), min_subset)?;
    info!(
        "Computed plaid with {} bins over {} cells",
        plaid.iter().max().unwrap() + 1,
        n_cells
    );

    // caller-supplied initial assignments replace the multi-start phase
    let init_labels: Option<(Vec<usize>, Vec<String>)> = match inputs.init_clust {
        Some(labels) => {
            let fixed_names: FxHashMap<&str, usize> = type_names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.as_str(), i))
                .collect();
            let mut free_set: Vec<String> = labels
                .iter()
                .filter(|l| !fixed_names.contains_key(l.as_str()))
                .cloned()
                .collect();
            free_set.sort();
            free_set.dedup();
            let free_map: FxHashMap<&str, usize> = free_set
                .iter()
                .enumerate()
                .map(|(i, n)| (n.as_str(), i))
                .collect();
            let mapped: Vec<usize> = labels
                .iter()
                .map(|l| match fixed_names.get(l.as_str()) {
                    Some(&t) => t,
                    None => n_fixed + free_map[l.as_str()],
                })
                .collect();
            Some((mapped, free_set))
        }
        None => None,
    };

    // resolve the free cluster count
    let n_free: usize = match &init_labels {
        Some((_, free_set)) => free_set.len(),
        None => match params.n_clusts {
            ClusterCount::Fixed(k) => k,
            ClusterCount::Range(lo, hi) => {
                let idx = sample_from_plaid(&plaid, pc, &mut rng);
                info!("Choosing the cluster count on {} cells", idx.len());
                let c = subset_rows(counts, &idx);
                let b = subset_vec(&bg, &idx);
                let a = anchor_idx.as_ref().map(|an| subset_vec(an, &idx));
                let (k, _) = choose_cluster_number(
                    c.as_ref(),
                    &b,
                    fixed_view,
                    a.as_deref(),
                    lo,
                    hi,
                    &engine_params(params, params.pct_drop),
                    seed.wrapping_add(77),
                )?;
                k
            }
            ClusterCount::Supervised => unreachable!(),
        },
    };
    if n_free == 0 && n_fixed == 0 {
        return Err("At least one cluster is required".to_string());
    }

    // phase 1: independent multi-start fits, benchmarked on a shared subset
    let (phase2_seed, mut free_names) = match init_labels {
        Some((labels, free_set)) => {
            info!("Phase 1 skipped: initial cluster assignments supplied");
            (Phase2Seed::Labels(labels), free_set)
        }
        None => {
            let n_starts = params.n_starts.max(1);
            info!(
                "Phase 1: {} random starts on subsets of {} cells",
                n_starts, p1
            );
            let p1_params = engine_params(params, params.pct_drop);
            let fits: Vec<NbClustResult> = (0..n_starts)
                .into_par_iter()
                .map(|start| {
                    let start_seed = seed.wrapping_add(100 + start as u64);
                    let mut srng = StdRng::seed_from_u64(start_seed);
                    let idx = sample_from_plaid(&plaid, p1, &mut srng);
                    let c = subset_rows(counts, &idx);
                    let b = subset_vec(&bg, &idx);
                    let a = anchor_idx.as_ref().map(|an| subset_vec(an, &idx));
                    nbclust(
                        c.as_ref(),
                        &b,
                        n_free,
                        fixed_view,
                        a.as_deref(),
                        ClusterInit::RoundRobin,
                        &p1_params,
                        start_seed,
                    )
                })
                .collect::<Result<Vec<_>, String>>()?;

            let bench_idx = sample_from_plaid(&plaid, pb, &mut rng);
            let bench_counts = subset_rows(counts, &bench_idx);
            let bench_bg = subset_vec(&bg, &bench_idx);
            let bench_signal = subset_vec(&signal, &bench_idx);

            let mut best = 0usize;
            let mut best_score = f64::NEG_INFINITY;
            for (i, fit) in fits.iter().enumerate() {
                let ll = nb_loglik_matrix(
                    bench_counts.as_ref(),
                    fit.profiles.as_ref(),
                    &bench_signal,
                    &bench_bg,
                    params.nb_size,
                );
                let score = total_best_loglik(ll.as_ref());
                if score > best_score {
                    best_score = score;
                    best = i;
                }
            }
            info!(
                "Phase 1 benchmark winner: start {} (log-likelihood {:.1})",
                best, best_score
            );
            let winner = &fits[best];
            let names = free_cluster_names(winner.profiles.ncols() - n_fixed);
            (Phase2Seed::Profiles(free_profiles(winner, n_fixed)), names)
        }
    };

    // phase 2: refinement on a larger subset with a looser tolerance
    info!("Phase 2: refining on {} cells", p2);
    let idx2 = sample_from_plaid(&plaid, p2, &mut rng);
    let c2 = subset_rows(counts, &idx2);
    let b2 = subset_vec(&bg, &idx2);
    let a2 = anchor_idx.as_ref().map(|an| subset_vec(an, &idx2));
    let init2 = match phase2_seed {
        Phase2Seed::Labels(labels) => ClusterInit::Labels(subset_vec(&labels, &idx2)),
        Phase2Seed::Profiles(profiles) => ClusterInit::Profiles(profiles),
    };
    let n_free_2 = free_names.len();
    let fit2 = nbclust(
        c2.as_ref(),
        &b2,
        n_free_2,
        fixed_view,
        a2.as_deref(),
        init2,
        &engine_params(params, params.pct_drop.max(0.2)),
        seed.wrapping_add(2),
    )?;
    free_names = prune_free_names(free_names, &fit2, n_fixed);

    // phase 3: final clustering at full tolerance on the largest subset
    info!("Phase 3: final clustering on {} cells", p3);
    let idx3 = sample_from_plaid(&plaid, p3, &mut rng);
    let c3 = subset_rows(counts, &idx3);
    let b3 = subset_vec(&bg, &idx3);
    let a3 = anchor_idx.as_ref().map(|an| subset_vec(an, &idx3));
    let fit3 = nbclust(
        c3.as_ref(),
        &b3,
        free_names.len(),
        fixed_view,
        a3.as_deref(),
        ClusterInit::Profiles(free_profiles(&fit2, n_fixed)),
        &engine_params(params, params.pct_drop),
        seed.wrapping_add(3),
    )?;
    free_names = prune_free_names(free_names, &fit3, n_fixed);

    // phase 4: classify every cell against the final profiles
    info!("Phase 4: classifying all {} cells", n_cells);
    let final_free = free_profiles(&fit3, n_fixed);
    let k_final = n_fixed + final_free.ncols();
    let profiles_raw = Mat::from_fn(n_genes, k_final, |g, j| {
        if j < n_fixed {
            reference_profiles.as_ref().unwrap()[(g, j)]
        } else {
            final_free[(g, j - n_fixed)]
        }
    });
    let cluster_names: Vec<String> = type_names
        .iter()
        .cloned()
        .chain(free_names.iter().cloned())
        .collect();

    let (assignment, prob, posterior, logliks) = classify_all(
        counts,
        &signal,
        &bg,
        profiles_raw.as_ref(),
        anchor_idx.as_deref(),
        cohort_ids.as_deref(),
        n_cohorts,
        Some((idx3.as_slice(), fit3.assignment.as_slice())),
        params.nb_size,
    )?;

    let clust = assignment
        .iter()
        .map(|&j| cluster_names[j].clone())
        .collect();
    let anchors_out = anchor_labels(anchor_idx, &type_names, n_cells);

    Ok(InsituTypeResult {
        clust,
        prob,
        posterior,
        logliks,
        profiles: normalise_matrix_col_sum(&profiles_raw.as_ref()),
        cluster_names,
        gene_names,
        anchors: anchors_out,
    })
}

/// The anchor set as display labels
fn anchor_labels(
    anchor_idx: Option<Vec<Option<usize>>>,
    type_names: &[String],
    n_cells: usize,
) -> Vec<Option<String>> {
    match anchor_idx {
        Some(anchors) => anchors
            .iter()
            .map(|a| a.map(|t| type_names[t].clone()))
            .collect(),
        None => vec![None; n_cells],
    }
}

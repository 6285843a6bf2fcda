use anyhow::{bail, Result};
use log::info;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::dataset::Assay;
use crate::motif::MotifAnnotation;
use crate::utils::{col_sums, csr_from_rows, row_sums, MatchedBins};

pub const DEFAULT_BACKGROUND_SETS: usize = 50;
const MATCH_BINS: usize = 10;

/// Per-cell motif deviation z-scores: the observed accessibility of each
/// motif's peak set relative to its depth-based expectation, standardized
/// against GC- and accessibility-matched background peak sets.
pub fn deviation_scores(
    counts: &CsrMatrix<f64>,
    annotation: &MotifAnnotation,
    gc: &[f64],
    n_background: usize,
    seed: u64,
) -> Result<Assay> {
    let n_peaks = counts.ncols();
    let n_cells = counts.nrows();
    let n_motifs = annotation.incidence.ncols();
    if annotation.incidence.nrows() != n_peaks {
        bail!(
            "annotation covers {} peaks but the count matrix has {}",
            annotation.incidence.nrows(),
            n_peaks
        );
    }
    if gc.len() != n_peaks {
        bail!("{} GC values for {} peaks", gc.len(), n_peaks);
    }
    if n_background < 2 {
        bail!("need at least 2 background sets, got {}", n_background);
    }

    let peak_totals = col_sums(counts);
    let grand_total: f64 = peak_totals.iter().sum();
    if grand_total <= 0.0 {
        bail!("count matrix is empty");
    }
    let expect_frac: Vec<f64> = peak_totals.iter().map(|&t| t / grand_total).collect();
    let depths = row_sums(counts);

    let observed = raw_deviation(counts, &annotation.incidence, &expect_frac, &depths);

    let log_access: Vec<f64> = peak_totals.iter().map(|&t| (1.0 + t).ln()).collect();
    let bins = MatchedBins::new(gc, &log_access, MATCH_BINS);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut mean = Array2::<f64>::zeros((n_cells, n_motifs));
    let mut m2 = Array2::<f64>::zeros((n_cells, n_motifs));
    for b in 0..n_background {
        let swap: Vec<usize> = (0..n_peaks)
            .map(|j| bins.sample_match(j, &mut rng))
            .collect();
        let mut coo = CooMatrix::new(n_peaks, n_motifs);
        for (j, m, &w) in annotation.incidence.triplet_iter() {
            coo.push(swap[j], m, w);
        }
        let background = CsrMatrix::from(&coo);
        let dev_b = raw_deviation(counts, &background, &expect_frac, &depths);
        // Welford accumulation
        let k = (b + 1) as f64;
        for ((i, m_idx), &v) in dev_b.indexed_iter() {
            let delta = v - mean[[i, m_idx]];
            mean[[i, m_idx]] += delta / k;
            m2[[i, m_idx]] += delta * (v - mean[[i, m_idx]]);
        }
    }

    let denom = (n_background - 1) as f64;
    let rows = (0..n_cells).map(|i| {
        (0..n_motifs)
            .filter_map(|m_idx| {
                let sd = (m2[[i, m_idx]] / denom).sqrt();
                if sd > 0.0 {
                    let z = (observed[[i, m_idx]] - mean[[i, m_idx]]) / sd;
                    (z != 0.0).then_some((m_idx, z))
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
    });
    let matrix = csr_from_rows(rows, n_motifs);
    info!(
        "deviation scores for {} motifs across {} cells ({} background sets)",
        n_motifs, n_cells, n_background
    );
    Assay::new(annotation.motif_ids.clone(), matrix)
}

/// Fractional deviation of observed motif counts from the depth expectation:
/// `(observed - expected) / expected`, zero where the expectation is zero.
fn raw_deviation(
    counts: &CsrMatrix<f64>,
    peak_sets: &CsrMatrix<f64>,
    expect_frac: &[f64],
    depths: &[f64],
) -> Array2<f64> {
    let n_cells = counts.nrows();
    let n_motifs = peak_sets.ncols();
    // expected fraction of reads landing in each motif's peak set
    let mut set_frac = vec![0.0; n_motifs];
    for (j, m, &w) in peak_sets.triplet_iter() {
        set_frac[m] += w * expect_frac[j];
    }
    let observed = counts * peak_sets;

    let mut dev = Array2::zeros((n_cells, n_motifs));
    for i in 0..n_cells {
        for (m, &f) in set_frac.iter().enumerate() {
            if f > 0.0 && depths[i] > 0.0 {
                dev[[i, m]] = -1.0;
            }
        }
    }
    for (i, m, &x) in observed.triplet_iter() {
        let expected = depths[i] * set_frac[m];
        if expected > 0.0 {
            dev[[i, m]] = (x - expected) / expected;
        }
    }
    dev
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motif::MotifAnnotation;

    /// 20 cells x 8 peaks. The motif covers peaks 0..4; cells 0..10 favor
    /// those peaks, cells 10..20 favor the rest. All peaks share GC and
    /// total accessibility, so background sets shuffle freely.
    fn toy() -> (CsrMatrix<f64>, MotifAnnotation, Vec<f64>) {
        let rows: Vec<Vec<(usize, f64)>> = (0..20)
            .map(|i| {
                (0..8)
                    .map(|j| {
                        let v = if (i < 10) == (j < 4) { 5.0 } else { 1.0 };
                        (j, v)
                    })
                    .collect()
            })
            .collect();
        let counts = csr_from_rows(rows, 8);
        let incidence = csr_from_rows(
            vec![
                vec![(0, 1.0)],
                vec![(0, 1.0)],
                vec![(0, 1.0)],
                vec![(0, 1.0)],
                vec![],
                vec![],
                vec![],
                vec![],
            ],
            1,
        );
        let annotation = MotifAnnotation {
            motif_ids: vec!["MA0001.1".into()],
            motif_names: vec!["Toy".into()],
            incidence,
        };
        let gc = vec![0.5; 8];
        (counts, annotation, gc)
    }

    #[test]
    fn z_scores_separate_the_groups() {
        let (counts, annotation, gc) = toy();
        let assay = deviation_scores(&counts, &annotation, &gc, 50, 1).unwrap();
        assert_eq!(assay.features, vec!["MA0001.1"]);
        assert_eq!(assay.matrix.nrows(), 20);
        let dense: Vec<f64> = (0..20)
            .map(|i| {
                let row = assay.matrix.row(i);
                row.values().first().copied().unwrap_or(0.0)
            })
            .collect();
        for i in 0..10 {
            assert!(dense[i] > 0.0, "cell {} should score positive", i);
            assert!(dense[i + 10] < 0.0, "cell {} should score negative", i + 10);
        }
    }

    #[test]
    fn deterministic_for_a_seed() {
        let (counts, annotation, gc) = toy();
        let a = deviation_scores(&counts, &annotation, &gc, 20, 7).unwrap();
        let b = deviation_scores(&counts, &annotation, &gc, 20, 7).unwrap();
        assert_eq!(a.matrix.values(), b.matrix.values());
    }

    #[test]
    fn raw_deviation_matches_by_hand() {
        let counts = csr_from_rows(vec![vec![(0, 3.0), (1, 1.0)]], 2);
        let sets = csr_from_rows(vec![vec![(0, 1.0)], vec![]], 1);
        // expected fraction for peak 0 is 0.75, depth 4 -> expected 3.0
        let dev = raw_deviation(&counts, &sets, &[0.75, 0.25], &[4.0]);
        assert!((dev[[0, 0]] - 0.0).abs() < 1e-12);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let (counts, annotation, _) = toy();
        assert!(deviation_scores(&counts, &annotation, &[0.5; 3], 10, 0).is_err());
    }
}

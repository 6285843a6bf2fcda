use anyhow::{bail, Result};
use log::info;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::utils::{col_sums, pearson, quantile, row_sums};

/// TF-IDF normalization of an accessibility count matrix (cells x features),
/// in place: term frequency per cell, inverse document frequency per feature,
/// `log1p` of the product scaled by 1e4.
pub fn tf_idf(counts: &mut CsrMatrix<f64>) {
    let n_cells = counts.nrows() as f64;
    let feature_totals = col_sums(counts);
    let idf: Vec<f64> = feature_totals
        .iter()
        .map(|&c| n_cells / (1.0 + c))
        .collect();
    let cell_totals = row_sums(counts);
    for (i, mut row) in counts.row_iter_mut().enumerate() {
        let total = cell_totals[i].max(1.0);
        let (cols, values) = row.cols_and_values_mut();
        for (&j, v) in cols.iter().zip(values.iter_mut()) {
            *v = (1.0 + 1e4 * (*v / total) * idf[j]).ln();
        }
    }
}

/// Indices of features whose total count exceeds the given quantile of the
/// per-feature totals (ascending index order).
pub fn select_top_features(counts: &CsrMatrix<f64>, min_quantile: f64) -> Result<Vec<usize>> {
    let totals = col_sums(counts);
    let Some(cutoff) = quantile(&totals, min_quantile) else {
        bail!("cannot compute feature cutoff on an empty matrix");
    };
    let kept: Vec<usize> = totals
        .iter()
        .enumerate()
        .filter_map(|(j, &c)| (c > cutoff).then_some(j))
        .collect();
    if kept.is_empty() {
        bail!("no features above the {:.2} quantile cutoff", min_quantile);
    }
    info!("kept {} of {} features", kept.len(), totals.len());
    Ok(kept)
}

/// Randomized truncated SVD of a sparse matrix (Halko et al. 2011, Alg 4.4
/// with QR re-orthonormalization). Deterministic for a fixed seed.
pub fn randomized_svd(
    a: &CsrMatrix<f64>,
    rank: usize,
    n_iter: usize,
    seed: u64,
) -> Result<(DMatrix<f64>, DVector<f64>, DMatrix<f64>)> {
    let (nr, nc) = (a.nrows(), a.ncols());
    if rank == 0 || rank > nr.min(nc) {
        bail!("rank {} out of range for a {} x {} matrix", rank, nr, nc);
    }
    let oversample = 5.min(nr.min(nc) - rank);
    let l = rank + oversample;

    let mut rng = StdRng::seed_from_u64(seed);
    let omega = DMatrix::from_fn(nc, l, |_, _| rng.gen::<f64>() * 2.0 - 1.0);

    let at = a.transpose();
    let thin_q = |m: DMatrix<f64>| -> DMatrix<f64> {
        let k = l.min(m.nrows());
        let qr = m.qr();
        qr.q().columns(0, k).into_owned()
    };

    let mut q = thin_q(a * &omega);
    for _ in 0..n_iter {
        let z = thin_q(&at * &q);
        q = thin_q(a * &z);
    }

    // b = q^T a, computed through the transpose to stay sparse-friendly
    let b = (&at * &q).transpose();
    let svd = b.svd(true, true);
    let (Some(u_b), Some(v_t)) = (svd.u, svd.v_t) else {
        bail!("SVD failed to converge");
    };
    let u = (&q * u_b.columns(0, rank)).into_owned();
    let v = v_t.transpose().columns(0, rank).into_owned();
    let s = svd.singular_values.rows(0, rank).into_owned();
    Ok((u, s, v))
}

/// Latent semantic indexing of a TF-IDF-normalized matrix.
pub struct LsiResult {
    /// Cells x components embedding (U * Sigma).
    pub embedding: Array2<f64>,
    pub singular_values: Vec<f64>,
    /// Pearson correlation of each component with log total counts; callers
    /// conventionally drop components dominated by sequencing depth.
    pub depth_correlation: Vec<f64>,
}

impl LsiResult {
    /// The embedding without components whose absolute depth correlation
    /// exceeds `max_cor` (component 1 is the usual casualty).
    pub fn drop_depth_components(&self, max_cor: f64) -> Array2<f64> {
        let kept: Vec<usize> = self
            .depth_correlation
            .iter()
            .enumerate()
            .filter_map(|(j, &c)| (c.abs() <= max_cor).then_some(j))
            .collect();
        let mut out = Array2::zeros((self.embedding.nrows(), kept.len()));
        for (new_j, &j) in kept.iter().enumerate() {
            out.column_mut(new_j).assign(&self.embedding.column(j));
        }
        out
    }
}

/// Run the linear factorization step of LSI: randomized SVD of the
/// normalized matrix, embedding scaled by the singular values.
/// `depths` are the per-cell raw fragment totals used for the
/// depth-correlation diagnostic.
pub fn lsi(
    normalized: &CsrMatrix<f64>,
    depths: &[f64],
    rank: usize,
    seed: u64,
) -> Result<LsiResult> {
    if depths.len() != normalized.nrows() {
        bail!(
            "{} depth values for {} cells",
            depths.len(),
            normalized.nrows()
        );
    }
    let (u, s, _v) = randomized_svd(normalized, rank, 5, seed)?;
    let n = normalized.nrows();
    let mut embedding = Array2::zeros((n, rank));
    for i in 0..n {
        for j in 0..rank {
            embedding[[i, j]] = u[(i, j)] * s[j];
        }
    }
    let log_depth: Vec<f64> = depths.iter().map(|&d| (1.0 + d).ln()).collect();
    let depth_correlation: Vec<f64> = (0..rank)
        .map(|j| {
            let comp: Vec<f64> = (0..n).map(|i| embedding[[i, j]]).collect();
            pearson(&comp, &log_depth)
        })
        .collect();
    info!(
        "LSI: rank {}, leading depth correlation {:.3}",
        rank,
        depth_correlation.first().copied().unwrap_or(0.0)
    );
    Ok(LsiResult {
        embedding,
        singular_values: s.iter().copied().collect(),
        depth_correlation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::csr_from_rows;

    #[test]
    fn tf_idf_is_finite_and_positive() {
        let mut m = csr_from_rows(
            vec![
                vec![(0, 2.0), (1, 1.0)],
                vec![(0, 1.0), (2, 4.0)],
                vec![(1, 3.0)],
            ],
            3,
        );
        tf_idf(&mut m);
        for v in m.values() {
            assert!(v.is_finite());
            assert!(*v > 0.0);
        }
    }

    #[test]
    fn top_features_by_quantile() {
        // feature totals: 10, 1, 5, 0
        let m = csr_from_rows(
            vec![vec![(0, 10.0), (2, 5.0)], vec![(1, 1.0)]],
            4,
        );
        let kept = select_top_features(&m, 0.5).unwrap();
        assert_eq!(kept, vec![0, 2]);
    }

    #[test]
    fn rsvd_recovers_a_low_rank_matrix() {
        // rank-2 matrix: outer products of two fixed vectors
        let n = 40;
        let rows: Vec<Vec<(usize, f64)>> = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        let v = (i as f64 + 1.0) * (j as f64 + 1.0)
                            + ((i % 3) as f64) * ((j % 5) as f64) * 10.0;
                        (j, v)
                    })
                    .collect()
            })
            .collect();
        let a = csr_from_rows(rows.clone(), n);
        let (u, s, v) = randomized_svd(&a, 2, 5, 7).unwrap();
        // reconstruct and compare
        let mut max_err: f64 = 0.0;
        for i in 0..n {
            for j in 0..n {
                let mut rec = 0.0;
                for k in 0..2 {
                    rec += u[(i, k)] * s[k] * v[(j, k)];
                }
                max_err = max_err.max((rec - rows[i][j].1).abs());
            }
        }
        let scale = s[0];
        assert!(max_err / scale < 1e-8, "relative error {}", max_err / scale);
    }

    #[test]
    fn rsvd_is_deterministic_for_a_seed() {
        let m = csr_from_rows(
            (0..20).map(|i| vec![(i % 7, (i + 1) as f64), ((i * 3) % 7, 2.0)]),
            7,
        );
        let (u1, s1, _) = randomized_svd(&m, 3, 4, 42).unwrap();
        let (u2, s2, _) = randomized_svd(&m, 3, 4, 42).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(u1, u2);
    }

    #[test]
    fn lsi_flags_depth_component() {
        // cells with wildly different depths but a shared structure: the
        // first component should track depth strongly
        let rows: Vec<Vec<(usize, f64)>> = (0..30)
            .map(|i| {
                let depth = if i < 15 { 1.0 } else { 20.0 };
                (0..10).map(|j| (j, depth * ((i + j) % 4 + 1) as f64)).collect()
            })
            .collect();
        let depths: Vec<f64> = rows
            .iter()
            .map(|r| r.iter().map(|x| x.1).sum())
            .collect();
        let m = csr_from_rows(rows, 10);
        let res = lsi(&m, &depths, 4, 1).unwrap();
        assert_eq!(res.embedding.nrows(), 30);
        assert!(res.depth_correlation[0].abs() > 0.9);
        let trimmed = res.drop_depth_components(0.9);
        assert!(trimmed.ncols() < 4);
    }
}

use anyhow::{bail, Result};
use log::info;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

use crate::dataset::{Assay, ScDataset};
use crate::utils::average_ranks;

const MAX_IRLS_ITER: usize = 25;
const IRLS_TOL: f64 = 1e-8;
const EFFECT_PSEUDO: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMethod {
    /// Logistic regression likelihood-ratio test with a log-depth covariate.
    Logistic,
    /// Wilcoxon rank-sum test with tie correction.
    Wilcoxon,
}

#[derive(Debug, Clone)]
pub struct DiffResult {
    pub id: String,
    /// Logistic: log2 fold change of group means (group1 over group2).
    /// Wilcoxon: difference of group means.
    pub effect: f64,
    pub p_value: f64,
    pub adj_p_value: f64,
    /// Detection fraction inside / outside group1.
    pub pct_in: f64,
    pub pct_out: f64,
}

/// Differential accessibility between two cell groups defined by an obs
/// label column. `group2 = None` compares against all remaining cells.
/// Features detected in fewer than `min_pct` of cells in both groups are
/// skipped. Results are BH-adjusted and sorted by adjusted then raw p-value.
pub fn diff_test(
    ds: &ScDataset,
    assay_name: &str,
    group_col: &str,
    group1: &str,
    group2: Option<&str>,
    method: TestMethod,
    min_pct: f64,
) -> Result<Vec<DiffResult>> {
    let labels = ds.obs_label(group_col)?;
    let mask1: Vec<bool> = labels.iter().map(|l| l == group1).collect();
    let mask2: Vec<bool> = match group2 {
        Some(g2) => labels.iter().map(|l| l == g2).collect(),
        None => mask1.iter().map(|&m| !m).collect(),
    };
    let n1 = mask1.iter().filter(|&&m| m).count();
    let n2 = mask2.iter().filter(|&&m| m).count();
    if n1 < 2 {
        bail!("group '{}' has {} cells, need at least 2", group1, n1);
    }
    if n2 < 2 {
        bail!("the comparison group has {} cells, need at least 2", n2);
    }
    let assay = ds.assay(assay_name)?;

    // cells used in the test, group1 first
    let cells: Vec<usize> = (0..ds.n_cells())
        .filter(|&i| mask1[i] || mask2[i])
        .collect();
    let y: Vec<f64> = cells.iter().map(|&i| mask1[i] as u8 as f64).collect();
    let log_depth: Vec<f64> = cells
        .iter()
        .map(|&i| {
            (1.0 + assay.matrix.row(i).values().iter().sum::<f64>()).ln()
        })
        .collect();

    let by_feature = assay.matrix.transpose();
    let pos: std::collections::HashMap<usize, usize> = cells
        .iter()
        .enumerate()
        .map(|(k, &i)| (i, k))
        .collect();
    let tested: Vec<(usize, f64, f64, f64, f64)> = (0..assay.n_features())
        .into_par_iter()
        .filter_map(|j| {
            let row = by_feature.row(j);
            let mut values = vec![0.0; cells.len()];
            for (&cell, &v) in row.col_indices().iter().zip(row.values()) {
                if let Some(&k) = pos.get(&cell) {
                    values[k] = v;
                }
            }
            let det1 = values
                .iter()
                .zip(&y)
                .filter(|(v, g)| **g == 1.0 && **v != 0.0)
                .count() as f64
                / n1 as f64;
            let det2 = values
                .iter()
                .zip(&y)
                .filter(|(v, g)| **g == 0.0 && **v != 0.0)
                .count() as f64
                / n2 as f64;
            if det1 < min_pct && det2 < min_pct {
                return None;
            }
            let mean1 = values
                .iter()
                .zip(&y)
                .filter(|(_, g)| **g == 1.0)
                .map(|(v, _)| v)
                .sum::<f64>()
                / n1 as f64;
            let mean2 = values
                .iter()
                .zip(&y)
                .filter(|(_, g)| **g == 0.0)
                .map(|(v, _)| v)
                .sum::<f64>()
                / n2 as f64;
            let (effect, p) = match method {
                TestMethod::Logistic => (
                    ((mean1 + EFFECT_PSEUDO) / (mean2 + EFFECT_PSEUDO)).log2(),
                    logistic_lrt(&y, &values, &log_depth),
                ),
                TestMethod::Wilcoxon => (mean1 - mean2, wilcoxon_test(&y, &values)),
            };
            Some((j, effect, p, det1, det2))
        })
        .collect();

    let p_values: Vec<f64> = tested.iter().map(|t| t.2).collect();
    let adjusted = adjustp::adjust(&p_values, adjustp::Procedure::BenjaminiHochberg);
    let mut results: Vec<DiffResult> = tested
        .into_iter()
        .zip(adjusted)
        .map(|((j, effect, p, det1, det2), padj)| DiffResult {
            id: assay.features[j].clone(),
            effect,
            p_value: p,
            adj_p_value: padj,
            pct_in: det1,
            pct_out: det2,
        })
        .collect();
    results.sort_by(|a, b| {
        (a.adj_p_value, a.p_value)
            .partial_cmp(&(b.adj_p_value, b.p_value))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    info!(
        "tested {} features ({} vs {} cells)",
        results.len(),
        n1,
        n2
    );
    Ok(results)
}

/// Likelihood-ratio test of the feature term in
/// `group ~ feature + log_depth` against `group ~ log_depth`.
fn logistic_lrt(y: &[f64], feature: &[f64], log_depth: &[f64]) -> f64 {
    if feature.iter().all(|&v| v == feature[0]) {
        return 1.0;
    }
    let n = y.len();
    let yv = DVector::from_column_slice(y);
    let x_full = DMatrix::from_fn(n, 3, |i, j| match j {
        0 => 1.0,
        1 => feature[i],
        _ => log_depth[i],
    });
    let x_null = DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { log_depth[i] });
    let ll_full = fit_logistic(&x_full, &yv);
    let ll_null = fit_logistic(&x_null, &yv);
    let stat = (2.0 * (ll_full - ll_null)).max(0.0);
    let chi2 = ChiSquared::new(1.0).expect("df = 1 is valid");
    1.0 - chi2.cdf(stat)
}

fn log_likelihood(x: &DMatrix<f64>, y: &DVector<f64>, beta: &DVector<f64>) -> f64 {
    let eta = x * beta;
    (0..x.nrows())
        .map(|i| {
            let p = (1.0 / (1.0 + (-eta[i]).exp())).clamp(1e-10, 1.0 - 1e-10);
            y[i] * p.ln() + (1.0 - y[i]) * (1.0 - p).ln()
        })
        .sum()
}

/// IRLS fit returning the best log-likelihood reached. Under complete
/// separation the coefficients diverge and the weighted normal equations
/// eventually degenerate; the fit then stops at the last finite iterate
/// instead of discarding it, so the likelihood still reflects the separation.
fn fit_logistic(x: &DMatrix<f64>, y: &DVector<f64>) -> f64 {
    let n = x.nrows();
    let k = x.ncols();
    let mut beta = DVector::zeros(k);
    let mut best = log_likelihood(x, y, &beta);
    for _ in 0..MAX_IRLS_ITER {
        let eta = x * &beta;
        let p: DVector<f64> =
            eta.map(|e| (1.0 / (1.0 + (-e).exp())).clamp(1e-10, 1.0 - 1e-10));
        let w: DVector<f64> = p.map(|pi| (pi * (1.0 - pi)).max(1e-10));
        // z = eta + (y - p) / w
        let z: DVector<f64> = DVector::from_fn(n, |i, _| eta[i] + (y[i] - p[i]) / w[i]);
        let xtw = DMatrix::from_fn(k, n, |a, i| x[(i, a)] * w[i]);
        let xtwx = &xtw * x;
        let xtwz = &xtw * &z;
        let Some(new_beta) = xtwx.lu().solve(&xtwz) else {
            break;
        };
        if new_beta.iter().any(|b| !b.is_finite()) {
            break;
        }
        let delta = (&new_beta - &beta).abs().max();
        beta = new_beta;
        best = best.max(log_likelihood(x, y, &beta));
        if delta < IRLS_TOL {
            break;
        }
    }
    best
}

/// Two-sided Wilcoxon rank-sum test via the tie-corrected normal
/// approximation. `y` is the group-one indicator.
pub fn wilcoxon_test(y: &[f64], values: &[f64]) -> f64 {
    let n = values.len();
    let n1 = y.iter().filter(|&&g| g == 1.0).count();
    let n2 = n - n1;
    if n1 == 0 || n2 == 0 {
        return 1.0;
    }
    let ranks = average_ranks(values);
    let r1: f64 = ranks
        .iter()
        .zip(y)
        .filter(|(_, g)| **g == 1.0)
        .map(|(r, _)| r)
        .sum();

    // tie correction term: sum of t^3 - t over tied groups
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut tie_term = 0.0;
    let mut run = 1usize;
    for i in 1..=n {
        if i < n && sorted[i] == sorted[i - 1] {
            run += 1;
        } else {
            let t = run as f64;
            tie_term += t * t * t - t;
            run = 1;
        }
    }
    let nf = n as f64;
    let var = (n1 as f64 * n2 as f64 / 12.0)
        * ((nf + 1.0) - tie_term / (nf * (nf - 1.0)));
    if var <= 0.0 {
        return 1.0;
    }
    let expected = n1 as f64 * (nf + 1.0) / 2.0;
    let z = (r1 - expected) / var.sqrt();
    let normal = Normal::new(0.0, 1.0).expect("unit normal is valid");
    2.0 * (1.0 - normal.cdf(z.abs())).min(0.5)
}

/// Convenience wrapper over [`diff_test`] for every cluster against the
/// rest, returning (cluster label, results) pairs.
pub fn diff_test_all_clusters(
    ds: &ScDataset,
    assay_name: &str,
    group_col: &str,
    method: TestMethod,
    min_pct: f64,
) -> Result<Vec<(String, Vec<DiffResult>)>> {
    let labels = ds.obs_label(group_col)?;
    let mut unique: Vec<String> = labels.to_vec();
    unique.sort();
    unique.dedup();
    unique
        .into_iter()
        .map(|g| {
            let res = diff_test(ds, assay_name, group_col, &g, None, method, min_pct)?;
            Ok((g, res))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Assay, ScDataset};
    use crate::utils::csr_from_rows;

    /// 40 cells, two groups of 20. Feature 0 is open almost only in group a,
    /// feature 1 is indistinguishable, feature 2 is rare everywhere.
    fn toy_dataset() -> ScDataset {
        let rows: Vec<Vec<(usize, f64)>> = (0..40)
            .map(|i| {
                let mut row = Vec::new();
                if i < 20 {
                    row.push((0, 3.0 + (i % 3) as f64));
                } else if i % 10 == 0 {
                    row.push((0, 1.0));
                }
                row.push((1, 1.0 + (i % 5) as f64 * 0.1));
                if i % 20 == 1 {
                    row.push((2, 1.0));
                }
                row
            })
            .collect();
        let assay = Assay::new(
            vec!["chr1:0-100".into(), "chr1:100-200".into(), "chr1:200-300".into()],
            csr_from_rows(rows, 3),
        )
        .unwrap();
        let names: Vec<String> = (0..40).map(|i| format!("BC{:02}", i)).collect();
        let mut ds = ScDataset::new(names, "peaks", assay).unwrap();
        let groups: Vec<String> = (0..40)
            .map(|i| if i < 20 { "a".into() } else { "b".into() })
            .collect();
        ds.add_obs_label("cluster", groups).unwrap();
        ds
    }

    #[test]
    fn logistic_ranks_the_planted_feature_first() {
        let ds = toy_dataset();
        let res = diff_test(
            &ds, "peaks", "cluster", "a", Some("b"), TestMethod::Logistic, 0.05,
        )
        .unwrap();
        assert_eq!(res[0].id, "chr1:0-100");
        assert!(res[0].p_value < 1e-4);
        assert!(res[0].effect > 1.0);
        assert!(res[0].pct_in > 0.9);
        let null = res.iter().find(|r| r.id == "chr1:100-200").unwrap();
        assert!(null.p_value > 0.05);
        // sorted by adjusted p-value
        for w in res.windows(2) {
            assert!(w[0].adj_p_value <= w[1].adj_p_value);
        }
    }

    #[test]
    fn wilcoxon_agrees_on_the_planted_feature() {
        let ds = toy_dataset();
        let res = diff_test(
            &ds, "peaks", "cluster", "a", None, TestMethod::Wilcoxon, 0.05,
        )
        .unwrap();
        assert_eq!(res[0].id, "chr1:0-100");
        assert!(res[0].p_value < 1e-4);
    }

    #[test]
    fn logistic_survives_complete_separation() {
        // feature 0 is open in every group-a cell and in no group-b cell;
        // feature 1 keeps the depths of the two groups overlapping
        let rows: Vec<Vec<(usize, f64)>> = (0..40)
            .map(|i| {
                let mut row = Vec::new();
                if i < 20 {
                    row.push((0, 2.0 + (i % 2) as f64));
                    row.push((1, 1.0 + (i % 4) as f64 * 0.2));
                } else {
                    row.push((1, 3.5 + (i % 4) as f64 * 0.2));
                }
                row
            })
            .collect();
        let assay = Assay::new(
            vec!["chr1:0-100".into(), "chr1:100-200".into()],
            csr_from_rows(rows, 2),
        )
        .unwrap();
        let names: Vec<String> = (0..40).map(|i| format!("BC{:02}", i)).collect();
        let mut ds = ScDataset::new(names, "peaks", assay).unwrap();
        let groups: Vec<String> = (0..40)
            .map(|i| if i < 20 { "a".into() } else { "b".into() })
            .collect();
        ds.add_obs_label("cluster", groups).unwrap();
        let res = diff_test(
            &ds, "peaks", "cluster", "a", Some("b"), TestMethod::Logistic, 0.0,
        )
        .unwrap();
        let hit = res.iter().find(|r| r.id == "chr1:0-100").unwrap();
        assert!(hit.p_value.is_finite());
        assert!(hit.p_value < 1e-6, "p = {}", hit.p_value);
    }

    #[test]
    fn min_pct_drops_rare_features() {
        let ds = toy_dataset();
        let res = diff_test(
            &ds, "peaks", "cluster", "a", None, TestMethod::Logistic, 0.1,
        )
        .unwrap();
        assert!(res.iter().all(|r| r.id != "chr1:200-300"));
    }

    #[test]
    fn empty_group_is_an_error() {
        let ds = toy_dataset();
        assert!(diff_test(
            &ds, "peaks", "cluster", "zzz", None, TestMethod::Logistic, 0.0,
        )
        .is_err());
    }

    #[test]
    fn wilcoxon_handles_constant_values() {
        let y = vec![1.0, 1.0, 0.0, 0.0];
        let v = vec![2.0, 2.0, 2.0, 2.0];
        assert_eq!(wilcoxon_test(&y, &v), 1.0);
    }
}

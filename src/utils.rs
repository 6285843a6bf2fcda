use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rand::rngs::StdRng;
use rand::Rng;

/// Empirical quantile with linear interpolation, ignoring non-finite values.
/// Returns `None` when no finite value is present.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    assert!((0.0..=1.0).contains(&q), "q must be in [0, 1]");
    let mut sorted: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n == 1 {
        return Some(sorted[0]);
    }
    let pos = q * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] * (1.0 - frac) + sorted[hi] * frac)
}

/// Average ranks (1-based) with ties sharing their mean rank.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap());
    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        // ranks i+1 ..= j+1 share their mean
        let rank = (i + j + 2) as f64 / 2.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Pearson correlation. Returns 0 for degenerate inputs.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    assert_eq!(x.len(), y.len());
    let n = x.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (&a, &b) in x.iter().zip(y.iter()) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    if sxx == 0.0 || syy == 0.0 {
        0.0
    } else {
        sxy / (sxx * syy).sqrt()
    }
}

/// Assemble a CSR matrix from per-row sparse `(column, value)` pairs.
/// Pairs within a row need not be sorted; duplicates are summed.
pub fn csr_from_rows<I>(rows: I, ncols: usize) -> CsrMatrix<f64>
where
    I: IntoIterator<Item = Vec<(usize, f64)>>,
{
    let rows: Vec<Vec<(usize, f64)>> = rows.into_iter().collect();
    let mut coo = CooMatrix::new(rows.len(), ncols);
    for (i, row) in rows.iter().enumerate() {
        for &(j, v) in row {
            coo.push(i, j, v);
        }
    }
    CsrMatrix::from(&coo)
}

/// Row sums of a CSR matrix.
pub fn row_sums(m: &CsrMatrix<f64>) -> Vec<f64> {
    m.row_iter().map(|row| row.values().iter().sum()).collect()
}

/// Column sums of a CSR matrix.
pub fn col_sums(m: &CsrMatrix<f64>) -> Vec<f64> {
    let mut sums = vec![0.0; m.ncols()];
    for row in m.row_iter() {
        for (&j, &v) in row.col_indices().iter().zip(row.values()) {
            sums[j] += v;
        }
    }
    sums
}

/// Select a subset of rows of a CSR matrix, in the given order.
pub fn select_rows(m: &CsrMatrix<f64>, indices: &[usize]) -> CsrMatrix<f64> {
    let rows = indices.iter().map(|&i| {
        let row = m.row(i);
        row.col_indices()
            .iter()
            .copied()
            .zip(row.values().iter().copied())
            .collect()
    });
    csr_from_rows(rows, m.ncols())
}

/// Select a subset of columns of a CSR matrix, in the given order.
pub fn select_columns(m: &CsrMatrix<f64>, indices: &[usize]) -> CsrMatrix<f64> {
    let mut remap = vec![usize::MAX; m.ncols()];
    for (new, &old) in indices.iter().enumerate() {
        remap[old] = new;
    }
    let rows = m.row_iter().map(|row| {
        row.col_indices()
            .iter()
            .zip(row.values())
            .filter_map(|(&j, &v)| {
                let nj = remap[j];
                (nj != usize::MAX).then_some((nj, v))
            })
            .collect()
    });
    csr_from_rows(rows, indices.len())
}

/// Items bucketed on a 2D grid over two covariates, for drawing covariate-
/// matched replacements (peaks matched on GC content and accessibility or
/// length). Non-finite covariates fall into the lowest bin.
pub struct MatchedBins {
    bins: Vec<Vec<usize>>,
    assignment: Vec<usize>,
}

impl MatchedBins {
    pub fn new(x: &[f64], y: &[f64], n_bins: usize) -> Self {
        assert_eq!(x.len(), y.len());
        assert!(n_bins > 0);
        let range = |values: &[f64]| -> (f64, f64) {
            let lo = values
                .iter()
                .copied()
                .filter(|a| a.is_finite())
                .fold(f64::INFINITY, f64::min);
            let hi = values
                .iter()
                .copied()
                .filter(|a| a.is_finite())
                .fold(f64::NEG_INFINITY, f64::max);
            (lo, hi)
        };
        let (x_lo, x_hi) = range(x);
        let (y_lo, y_hi) = range(y);
        let bin_index = |v: f64, lo: f64, hi: f64| -> usize {
            if !v.is_finite() || hi <= lo {
                0
            } else {
                (((v - lo) / (hi - lo) * n_bins as f64) as usize).min(n_bins - 1)
            }
        };
        let mut bins = vec![Vec::new(); n_bins * n_bins];
        let mut assignment = Vec::with_capacity(x.len());
        for (i, (&a, &b)) in x.iter().zip(y.iter()).enumerate() {
            let bin = bin_index(a, x_lo, x_hi) * n_bins + bin_index(b, y_lo, y_hi);
            bins[bin].push(i);
            assignment.push(bin);
        }
        MatchedBins { bins, assignment }
    }

    /// A random item from the same bin as `item` (possibly `item` itself).
    pub fn sample_match(&self, item: usize, rng: &mut StdRng) -> usize {
        let members = &self.bins[self.assignment[item]];
        members[rng.gen_range(0..members.len())]
    }

    pub fn bin_of(&self, item: usize) -> usize {
        self.assignment[item]
    }

    pub fn bin_members(&self, bin: usize) -> &[usize] {
        &self.bins[bin]
    }
}

/// Stack CSR matrices with identical column counts on top of each other.
pub fn vstack(mats: &[&CsrMatrix<f64>]) -> CsrMatrix<f64> {
    let ncols = mats.first().map_or(0, |m| m.ncols());
    let rows = mats.iter().flat_map(|m| {
        assert_eq!(m.ncols(), ncols, "column counts differ");
        m.row_iter().map(|row| {
            row.col_indices()
                .iter()
                .copied()
                .zip(row.values().iter().copied())
                .collect::<Vec<_>>()
        })
    });
    csr_from_rows(rows, ncols)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantile_interpolates() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&xs, 0.0), Some(1.0));
        assert_eq!(quantile(&xs, 1.0), Some(5.0));
        assert_eq!(quantile(&xs, 0.5), Some(3.0));
        assert_eq!(quantile(&xs, 0.25), Some(2.0));
    }

    #[test]
    fn quantile_skips_nan() {
        let xs = [f64::NAN, 1.0, 3.0];
        assert_eq!(quantile(&xs, 0.5), Some(2.0));
        assert_eq!(quantile(&[f64::NAN], 0.5), None);
    }

    #[test]
    fn ranks_handle_ties() {
        let ranks = average_ranks(&[10.0, 20.0, 20.0, 30.0]);
        assert_eq!(ranks, vec![1.0, 2.5, 2.5, 4.0]);
    }

    #[test]
    fn pearson_sign() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&x, &y) - 1.0).abs() < 1e-12);
        let z = [8.0, 6.0, 4.0, 2.0];
        assert!((pearson(&x, &z) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn csr_row_column_selection() {
        let m = csr_from_rows(
            vec![vec![(0, 1.0), (2, 2.0)], vec![(1, 3.0)], vec![(2, 4.0)]],
            3,
        );
        let rows = select_rows(&m, &[2, 0]);
        assert_eq!(rows.nrows(), 2);
        assert_eq!(rows.row(0).values(), &[4.0]);
        let cols = select_columns(&m, &[2, 1]);
        assert_eq!(cols.ncols(), 2);
        assert_eq!(cols.row(0).col_indices(), &[0]);
        assert_eq!(cols.row(1).col_indices(), &[1]);
    }

    #[test]
    fn matched_bins_group_similar_items() {
        use rand::SeedableRng;
        let gc = [0.1, 0.12, 0.9, 0.88, 0.11, 0.91];
        let len = [100.0, 101.0, 130.0, 131.0, 102.0, 129.0];
        let bins = MatchedBins::new(&gc, &len, 4);
        assert_eq!(bins.bin_of(0), bins.bin_of(1));
        assert_eq!(bins.bin_of(2), bins.bin_of(3));
        assert_ne!(bins.bin_of(0), bins.bin_of(2));
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        for _ in 0..20 {
            let m = bins.sample_match(0, &mut rng);
            assert!([0usize, 1, 4].contains(&m));
        }
    }

    #[test]
    fn vstack_concatenates_rows() {
        let a = csr_from_rows(vec![vec![(0, 1.0)]], 2);
        let b = csr_from_rows(vec![vec![(1, 2.0)], vec![(0, 3.0)]], 2);
        let s = vstack(&[&a, &b]);
        assert_eq!(s.nrows(), 3);
        assert_eq!(s.row(1).col_indices(), &[1]);
        assert_eq!(s.row(2).values(), &[3.0]);
    }
}

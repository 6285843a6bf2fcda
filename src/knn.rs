use anyhow::{bail, Result};
use hora::core::ann_index::ANNIndex;
use kdtree::distance::squared_euclidean;
use kdtree::kdtree::KdTree;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::ArrayView2;
use rayon::prelude::*;
use smallvec::SmallVec;

/// K nearest neighbours of every point by exact kd-tree search. Each row of
/// the result holds the distances to the k neighbours of that point (the
/// point itself excluded).
pub fn nearest_neighbour_graph(points: ArrayView2<'_, f64>, k: usize) -> Result<CsrMatrix<f64>> {
    let n = points.nrows();
    if k == 0 || k >= n {
        bail!("k = {} out of range for {} points", k, n);
    }
    let dimensions = points.ncols();
    let mut kdtree = KdTree::new(dimensions);
    for (i, point) in points.outer_iter().enumerate() {
        kdtree
            .add(point.iter().cloned().collect::<SmallVec<[f64; 64]>>(), i)
            .map_err(|e| anyhow::anyhow!("kd-tree insertion failed: {:?}", e))?;
    }

    let neighbours: Vec<Vec<(usize, f64)>> = points
        .outer_iter()
        .into_par_iter()
        .enumerate()
        .map(|(i, point)| {
            let point = point.iter().cloned().collect::<SmallVec<[f64; 64]>>();
            kdtree
                .iter_nearest(point.as_slice(), &squared_euclidean)
                .unwrap()
                .filter_map(|(distance, index)| {
                    (*index != i).then(|| (*index, distance.sqrt()))
                })
                .take(k)
                .collect()
        })
        .collect();
    Ok(to_csr_matrix(neighbours))
}

/// Approximate variant of [`nearest_neighbour_graph`] using an HNSW index,
/// for datasets where the exact search is too slow.
pub fn approximate_nearest_neighbour_graph(
    points: ArrayView2<'_, f64>,
    k: usize,
) -> Result<CsrMatrix<f64>> {
    let n = points.nrows();
    if k == 0 || k >= n {
        bail!("k = {} out of range for {} points", k, n);
    }
    let mut index = hora::index::hnsw_idx::HNSWIndex::<f32, usize>::new(
        points.ncols(),
        &hora::index::hnsw_params::HNSWParams::<f32>::default().max_item(n.max(1_000_000)),
    );
    for (i, sample) in points.outer_iter().enumerate() {
        let v: Vec<f32> = sample.iter().map(|&x| x as f32).collect();
        index
            .add(v.as_slice(), i)
            .map_err(|e| anyhow::anyhow!("HNSW insertion failed: {}", e))?;
    }
    index
        .build(hora::core::metrics::Metric::Euclidean)
        .map_err(|e| anyhow::anyhow!("HNSW build failed: {}", e))?;
    let neighbours: Vec<Vec<(usize, f64)>> = points
        .outer_iter()
        .into_par_iter()
        .enumerate()
        .map(|(i, row)| {
            let v: Vec<f32> = row.iter().map(|&x| x as f32).collect();
            index
                .search_nodes(v.as_slice(), k + 1)
                .into_iter()
                .filter_map(|(node, d)| {
                    let idx = node.idx().unwrap();
                    (idx != i).then(|| (idx, d as f64))
                })
                .take(k)
                .collect()
        })
        .collect();
    Ok(to_csr_matrix(neighbours))
}

fn to_csr_matrix(rows: Vec<Vec<(usize, f64)>>) -> CsrMatrix<f64> {
    let n = rows.len();
    let mut data = Vec::new();
    let mut indices = Vec::new();
    let mut indptr = Vec::with_capacity(n + 1);
    let mut nnz = 0usize;
    for mut row in rows {
        row.sort_by(|a, b| a.0.cmp(&b.0));
        indptr.push(nnz);
        nnz += row.len();
        for (j, d) in row {
            indices.push(j);
            data.push(d);
        }
    }
    indptr.push(nnz);
    CsrMatrix::try_from_csr_data(n, n, indptr, indices, data)
        .expect("neighbour lists form a valid CSR matrix")
}

/// Turn a distance graph into a symmetric similarity graph: distances are
/// mapped through an exponential kernel scaled by each node's mean neighbour
/// distance, and edges are symmetrized by averaging.
pub fn similarity_graph(distances: &CsrMatrix<f64>) -> CsrMatrix<f64> {
    let n = distances.nrows();
    let scales: Vec<f64> = (0..n)
        .map(|i| {
            let row = distances.row(i);
            if row.nnz() == 0 {
                1.0
            } else {
                let mean = row.values().iter().sum::<f64>() / row.nnz() as f64;
                mean.max(f64::EPSILON)
            }
        })
        .collect();
    let mut coo = CooMatrix::new(n, n);
    for (i, j, &d) in distances.triplet_iter() {
        let w = 0.5 * ((-d / scales[i]).exp() + (-d / scales[j]).exp());
        coo.push(i, j, 0.5 * w);
        coo.push(j, i, 0.5 * w);
    }
    // duplicate (i, j) entries sum, so mutual edges average to w
    CsrMatrix::from(&coo)
}

use anyhow::{bail, Result};
use log::info;
use nalgebra_sparse::CsrMatrix;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::embedding::randomized_svd;

const TOLERANCE: f64 = 1e-6;

/// A weighted undirected graph in adjacency-list form. Every edge appears in
/// both endpoint lists; self loops are kept separately. `sizes` counts the
/// original nodes folded into each vertex across aggregation levels.
struct Graph {
    adj: Vec<Vec<(usize, f64)>>,
    loops: Vec<f64>,
    degrees: Vec<f64>,
    sizes: Vec<usize>,
    total: f64,
}

impl Graph {
    fn from_csr(m: &CsrMatrix<f64>) -> Self {
        let n = m.nrows();
        let mut adj = vec![Vec::new(); n];
        let mut loops = vec![0.0; n];
        for (i, j, &w) in m.triplet_iter() {
            if i == j {
                loops[i] += w;
            } else {
                adj[i].push((j, w));
            }
        }
        let degrees: Vec<f64> = (0..n)
            .map(|i| adj[i].iter().map(|x| x.1).sum::<f64>() + 2.0 * loops[i])
            .collect();
        let total = degrees.iter().sum();
        Graph {
            adj,
            loops,
            degrees,
            sizes: vec![1; n],
            total,
        }
    }

    fn n_nodes(&self) -> usize {
        self.adj.len()
    }

    /// Mean weight of the distinct undirected edges, or `None` when there are
    /// none.
    fn mean_edge_weight(&self) -> Option<f64> {
        let entries: usize = self.adj.iter().map(|a| a.len()).sum();
        if entries == 0 {
            return None;
        }
        let sum: f64 = self.adj.iter().flatten().map(|x| x.1).sum();
        Some(sum / entries as f64)
    }

    /// Collapse communities into single nodes, summing parallel edges.
    fn aggregate(&self, labels: &[usize], n_comm: usize) -> Graph {
        let mut adj_maps: Vec<std::collections::HashMap<usize, f64>> =
            vec![Default::default(); n_comm];
        let mut loops = vec![0.0; n_comm];
        let mut sizes = vec![0usize; n_comm];
        for (i, neigh) in self.adj.iter().enumerate() {
            let ci = labels[i];
            loops[ci] += self.loops[i];
            sizes[ci] += self.sizes[i];
            for &(j, w) in neigh {
                let cj = labels[j];
                if ci == cj {
                    // both directions are visited, halve to count once
                    loops[ci] += 0.5 * w;
                } else {
                    *adj_maps[ci].entry(cj).or_insert(0.0) += w;
                }
            }
        }
        let adj: Vec<Vec<(usize, f64)>> =
            adj_maps.into_iter().map(|m| m.into_iter().collect()).collect();
        let degrees: Vec<f64> = (0..n_comm)
            .map(|i| adj[i].iter().map(|x| x.1).sum::<f64>() + 2.0 * loops[i])
            .collect();
        let total = degrees.iter().sum();
        Graph {
            adj,
            loops,
            degrees,
            sizes,
            total,
        }
    }
}

/// One level of local moving under the constant Potts objective: moving a
/// vertex into a community gains the edge weight towards it minus `gamma`
/// per node pair the move creates. The vertex is taken out of its own
/// community first, so staying put competes on equal terms. Returns the
/// vertex labels and whether anything moved.
fn move_nodes(graph: &Graph, gamma: f64, rng: &mut StdRng) -> (Vec<usize>, bool) {
    let n = graph.n_nodes();
    let mut labels: Vec<usize> = (0..n).collect();
    let mut comm_size: Vec<f64> = graph.sizes.iter().map(|&s| s as f64).collect();
    let mut order: Vec<usize> = (0..n).collect();
    let mut improved = false;
    let mut neigh_weight: Vec<f64> = vec![0.0; n];

    loop {
        let mut moved = 0usize;
        order.shuffle(rng);
        for &i in &order {
            let old = labels[i];
            let size_i = graph.sizes[i] as f64;
            // weights from i to each neighbouring community
            let mut touched: Vec<usize> = Vec::with_capacity(graph.adj[i].len());
            for &(j, w) in &graph.adj[i] {
                let c = labels[j];
                if neigh_weight[c] == 0.0 {
                    touched.push(c);
                }
                neigh_weight[c] += w;
            }
            comm_size[old] -= size_i;
            let base = neigh_weight[old] - gamma * size_i * comm_size[old];
            let mut best = old;
            let mut best_gain = base;
            for &c in &touched {
                if c == old {
                    continue;
                }
                let gain = neigh_weight[c] - gamma * size_i * comm_size[c];
                if gain > best_gain + TOLERANCE {
                    best_gain = gain;
                    best = c;
                }
            }
            comm_size[best] += size_i;
            labels[i] = best;
            if best != old {
                moved += 1;
                improved = true;
            }
            for &c in &touched {
                neigh_weight[c] = 0.0;
            }
            neigh_weight[old] = 0.0;
        }
        if moved == 0 {
            break;
        }
    }
    (labels, improved)
}

fn compact_labels(labels: &mut [usize]) -> usize {
    let mut remap: std::collections::HashMap<usize, usize> = Default::default();
    for l in labels.iter_mut() {
        let next = remap.len();
        *l = *remap.entry(*l).or_insert(next);
    }
    remap.len()
}

/// Relabel so cluster 0 is the largest, 1 the next, and so on.
fn relabel_by_size(labels: &mut [usize], n_comm: usize) {
    let mut sizes = vec![0usize; n_comm];
    for &l in labels.iter() {
        sizes[l] += 1;
    }
    let mut order: Vec<usize> = (0..n_comm).collect();
    order.sort_by_key(|&c| std::cmp::Reverse(sizes[c]));
    let mut rank = vec![0usize; n_comm];
    for (r, &c) in order.iter().enumerate() {
        rank[c] = r;
    }
    for l in labels.iter_mut() {
        *l = rank[*l];
    }
}

/// Weighted modularity of a labeling, with a resolution parameter.
pub fn modularity(graph: &CsrMatrix<f64>, labels: &[usize], resolution: f64) -> f64 {
    let g = Graph::from_csr(graph);
    let n_comm = labels.iter().max().map_or(0, |m| m + 1);
    let mut internal = vec![0.0; n_comm];
    let mut total = vec![0.0; n_comm];
    for i in 0..g.n_nodes() {
        total[labels[i]] += g.degrees[i];
        internal[labels[i]] += 2.0 * g.loops[i];
        for &(j, w) in &g.adj[i] {
            if labels[j] == labels[i] {
                internal[labels[i]] += w;
            }
        }
    }
    (0..n_comm)
        .map(|c| internal[c] / g.total - resolution * (total[c] / g.total).powi(2))
        .sum()
}

/// Multi-level Louvain community detection on a symmetric weighted graph,
/// optimizing a constant Potts quality. The resolution is normalized by the
/// mean edge weight over the node count, so groups joined by no edges stay
/// separate at any resolution and higher values split finer. Deterministic
/// for a fixed seed. Returns cluster labels ordered by decreasing cluster
/// size.
pub fn louvain(graph: &CsrMatrix<f64>, resolution: f64, seed: u64) -> Result<Vec<usize>> {
    if graph.nrows() != graph.ncols() {
        bail!("adjacency matrix is not square");
    }
    if graph.nrows() == 0 {
        bail!("empty graph");
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut g = Graph::from_csr(graph);
    let Some(mean_weight) = g.mean_edge_weight() else {
        bail!("graph has no edges");
    };
    let gamma = resolution * mean_weight / (2.0 * g.n_nodes() as f64);
    let mut membership: Vec<usize> = (0..g.n_nodes()).collect();
    for level in 0.. {
        let (mut labels, improved) = move_nodes(&g, gamma, &mut rng);
        let n_comm = compact_labels(&mut labels);
        for m in membership.iter_mut() {
            *m = labels[*m];
        }
        info!("level {}: {} communities", level, n_comm);
        if !improved || n_comm == g.n_nodes() {
            break;
        }
        g = g.aggregate(&labels, n_comm);
    }
    let n_comm = compact_labels(&mut membership);
    relabel_by_size(&mut membership, n_comm);
    info!(
        "louvain: {} clusters, modularity {:.4}",
        n_comm,
        modularity(graph, &membership, resolution)
    );
    Ok(membership)
}

/// Two (or more) dimensional layout from the leading non-trivial
/// eigenvectors of the symmetrically normalized adjacency matrix.
pub fn spectral_layout(graph: &CsrMatrix<f64>, dims: usize, seed: u64) -> Result<Array2<f64>> {
    let n = graph.nrows();
    if graph.ncols() != n {
        bail!("adjacency matrix is not square");
    }
    let degrees: Vec<f64> = (0..n)
        .map(|i| graph.row(i).values().iter().sum::<f64>())
        .collect();
    if degrees.iter().any(|&d| d <= 0.0) {
        bail!("graph has isolated nodes");
    }
    let (indptr, indices, values) = (
        graph.row_offsets().to_vec(),
        graph.col_indices().to_vec(),
        graph
            .triplet_iter()
            .map(|(i, j, &w)| w / (degrees[i] * degrees[j]).sqrt())
            .collect::<Vec<f64>>(),
    );
    let normalized = CsrMatrix::try_from_csr_data(n, n, indptr, indices, values)
        .map_err(|e| anyhow::anyhow!("normalization failed: {}", e))?;
    // the leading eigenvector is the trivial sqrt-degree direction
    let (u, _s, _v) = randomized_svd(&normalized, dims + 1, 10, seed)?;
    let mut layout = Array2::zeros((n, dims));
    for i in 0..n {
        for j in 0..dims {
            layout[[i, j]] = u[(i, j + 1)] / degrees[i].sqrt();
        }
    }
    // unit scale per dimension keeps layouts comparable across runs
    for j in 0..dims {
        let max = layout
            .column(j)
            .iter()
            .fold(0.0f64, |a, &b| a.max(b.abs()));
        if max > 0.0 {
            layout.column_mut(j).mapv_inplace(|x| x / max);
        }
    }
    Ok(layout)
}

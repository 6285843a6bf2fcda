use itertools::Itertools;
use nalgebra_sparse::CsrMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use atacsuite::clustering::{louvain, spectral_layout};
use atacsuite::dataset::{Assay, ScDataset};
use atacsuite::deviations::deviation_scores;
use atacsuite::diff::{diff_test, TestMethod};
use atacsuite::embedding::{lsi, tf_idf};
use atacsuite::enrichment::{ks_statistic, motif_enrichment};
use atacsuite::genome::Genome;
use atacsuite::knn::{nearest_neighbour_graph, similarity_graph};
use atacsuite::motif::{annotate_regions, parse_jaspar};
use atacsuite::utils::{csr_from_rows, row_sums};

const N_PEAKS: usize = 40;
const CELLS_PER_SAMPLE: usize = 30;

fn peak_key(i: usize) -> String {
    format!("chr1:{}-{}", i * 1000, i * 1000 + 500)
}

/// Cells 0..15 of each sample are type "open-low" (peaks 0..20), the rest
/// are "open-high" (peaks 20..40), with deterministic count noise.
fn sample_dataset(sample: usize) -> ScDataset {
    let rows: Vec<Vec<(usize, f64)>> = (0..CELLS_PER_SAMPLE)
        .map(|i| {
            let open_low = i < CELLS_PER_SAMPLE / 2;
            (0..N_PEAKS)
                .filter_map(|j| {
                    let in_block = (j < 20) == open_low;
                    if in_block {
                        Some((j, 1.0 + ((i * 7 + j + sample) % 3) as f64))
                    } else if (i + j + sample) % 9 == 0 {
                        Some((j, 1.0))
                    } else {
                        None
                    }
                })
                .collect()
        })
        .collect();
    let matrix = csr_from_rows(rows, N_PEAKS);
    let features: Vec<String> = (0..N_PEAKS).map(peak_key).collect();
    let names: Vec<String> = (0..CELLS_PER_SAMPLE)
        .map(|i| format!("BC{:03}-{}", i, sample))
        .collect();
    ScDataset::new(names, "peaks", Assay::new(features, matrix).unwrap()).unwrap()
}

fn cell_is_open_low(merged_index: usize) -> bool {
    merged_index % CELLS_PER_SAMPLE < CELLS_PER_SAMPLE / 2
}

fn peak_index(key: &str) -> usize {
    let start: usize = key
        .split(':')
        .nth(1)
        .unwrap()
        .split('-')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    start / 1000
}

fn cluster_merged() -> (ScDataset, Vec<usize>) {
    let merged =
        ScDataset::merge(vec![sample_dataset(0), sample_dataset(1)], &["s1", "s2"]).unwrap();
    assert_eq!(merged.n_cells(), 2 * CELLS_PER_SAMPLE);

    let counts = merged.default_assay().matrix.clone();
    let depths = row_sums(&counts);
    let mut normalized: CsrMatrix<f64> = counts;
    tf_idf(&mut normalized);
    let embedding = lsi(&normalized, &depths, 10, 0).unwrap();
    let coords = embedding.drop_depth_components(0.95);
    assert!(coords.ncols() >= 2);

    let distances = nearest_neighbour_graph(coords.view(), 10).unwrap();
    let graph = similarity_graph(&distances);
    let labels = louvain(&graph, 1.0, 0).unwrap();

    let mut ds = merged;
    ds.add_embedding("lsi", coords).unwrap();
    let layout = spectral_layout(&graph, 2, 0).unwrap();
    ds.add_embedding("layout", layout).unwrap();
    ds.add_obs_label("cluster", labels.iter().map(|l| l.to_string()).collect())
        .unwrap();
    (ds, labels)
}

#[test]
fn merge_embed_cluster_recovers_cell_types() {
    let (ds, labels) = cluster_merged();

    // both samples contribute every cell exactly once
    let samples = ds.obs_label("sample").unwrap();
    assert_eq!(samples.iter().filter(|s| *s == "s1").count(), CELLS_PER_SAMPLE);
    assert_eq!(samples.iter().filter(|s| *s == "s2").count(), CELLS_PER_SAMPLE);

    // the two planted cell types end up in two distinct clusters
    let low_label = labels[0];
    let high_label = labels[CELLS_PER_SAMPLE / 2];
    assert_ne!(low_label, high_label);
    for (i, &l) in labels.iter().enumerate() {
        if cell_is_open_low(i) {
            assert_eq!(l, low_label, "cell {} misclustered", i);
        } else {
            assert_eq!(l, high_label, "cell {} misclustered", i);
        }
    }

    // the 2D layout separates the types as well
    let layout = ds.embedding("layout").unwrap();
    let centroid = |low: bool| -> (f64, f64) {
        let idx: Vec<usize> = (0..ds.n_cells()).filter(|&i| cell_is_open_low(i) == low).collect();
        let n = idx.len() as f64;
        (
            idx.iter().map(|&i| layout[[i, 0]]).sum::<f64>() / n,
            idx.iter().map(|&i| layout[[i, 1]]).sum::<f64>() / n,
        )
    };
    let (ax, ay) = centroid(true);
    let (bx, by) = centroid(false);
    let gap = ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt();
    assert!(gap > 0.1, "layout centroids too close: {}", gap);
}

#[test]
fn differential_peaks_match_the_planted_blocks() {
    let (ds, labels) = cluster_merged();
    let low_cluster = labels[0].to_string();
    let results = diff_test(
        &ds,
        "peaks",
        "cluster",
        &low_cluster,
        None,
        TestMethod::Logistic,
        0.05,
    )
    .unwrap();

    // the strongest markers of the open-low cluster are low-block peaks
    for r in results.iter().take(5) {
        assert!(peak_index(&r.id) < 20, "unexpected top marker {}", r.id);
        assert!(r.effect > 0.0, "marker {} has the wrong sign", r.id);
    }
    assert!(results[0].adj_p_value < 1e-3);

    // wilcoxon agrees
    let wilcoxon = diff_test(
        &ds,
        "peaks",
        "cluster",
        &low_cluster,
        None,
        TestMethod::Wilcoxon,
        0.05,
    )
    .unwrap();
    assert!(peak_index(&wilcoxon[0].id) < 20);
    assert!(wilcoxon[0].effect > 0.0);
    assert!(wilcoxon[0].p_value < 1e-3);
}

const JASPAR: &str = "\
>MA0099.1 Planted
A  [  1  1  1  1 97 97 ]
C  [ 97 97  1  1  1  1 ]
G  [  1  1 97  1  1  1 ]
T  [  1  1  1 97  1  1 ]
";

/// A 41 kb chromosome where peak i and peak i + 20 share the same random
/// block (so their GC content matches), with the motif CCGTAA planted only
/// in the first 20 peaks. GC varies across blocks to exercise the matched
/// background binning.
fn synthetic_genome() -> Genome {
    let mut rng = StdRng::seed_from_u64(11);
    let mut seq = vec![b'A'; 41_000];
    for b in 0..20usize {
        let gc_p = [0.35, 0.45, 0.55, 0.65][b % 4];
        let block: Vec<u8> = (0..1000)
            .map(|_| {
                if rng.gen_bool(gc_p) {
                    if rng.gen_bool(0.5) {
                        b'G'
                    } else {
                        b'C'
                    }
                } else if rng.gen_bool(0.5) {
                    b'A'
                } else {
                    b'T'
                }
            })
            .collect();
        seq[b * 1000..(b + 1) * 1000].copy_from_slice(&block);
        seq[(b + 20) * 1000..(b + 21) * 1000].copy_from_slice(&block);
        let at = b * 1000 + 100;
        seq[at..at + 6].copy_from_slice(b"CCGTAA");
    }
    Genome::from_sequences([("chr1", seq)])
}

#[test]
fn motif_deviations_and_enrichment_track_the_planted_motif() {
    let (ds, _labels) = cluster_merged();
    let genome = synthetic_genome();
    let peaks: Vec<_> = (0..N_PEAKS)
        .map(|i| atacsuite::genome::parse_region_key(&peak_key(i)).unwrap())
        .collect();
    let motifs = parse_jaspar(JASPAR).unwrap();
    let annotation = annotate_regions(&peaks, &genome, motifs, 1e-4).unwrap();

    // every planted peak carries the motif
    for i in 0..20 {
        assert_eq!(annotation.incidence.row(i).nnz(), 1, "peak {} missed", i);
    }

    // scanning is deterministic
    let again =
        annotate_regions(&peaks, &genome, parse_jaspar(JASPAR).unwrap(), 1e-4).unwrap();
    assert_eq!(annotation.incidence, again.incidence);

    let gc: Vec<f64> = peaks
        .iter()
        .map(|r| genome.gc_content(r).unwrap())
        .collect();
    let deviations =
        deviation_scores(&ds.default_assay().matrix, &annotation, &gc, 50, 3).unwrap();

    // open-low cells (which favor motif peaks) score high, the rest low
    let z: Vec<f64> = (0..ds.n_cells())
        .map(|i| {
            let row = deviations.matrix.row(i);
            row.values().first().copied().unwrap_or(0.0)
        })
        .collect();
    let (low, high): (Vec<f64>, Vec<f64>) = z
        .iter()
        .enumerate()
        .partition_map(|(i, &v)| {
            if cell_is_open_low(i) {
                itertools::Either::Left(v)
            } else {
                itertools::Either::Right(v)
            }
        });
    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
    assert!(mean(&low) > mean(&high));
    assert!(ks_statistic(&low, &high) > 0.8);

    // the motif is over-represented in the planted peak set
    let lengths = vec![500.0; N_PEAKS];
    let query: Vec<usize> = (0..20).collect();
    let enriched = motif_enrichment(&annotation, &query, &gc, &lengths, 5000, 0).unwrap();
    assert_eq!(enriched[0].motif_id, "MA0099.1");
    assert!(enriched[0].p_value < 1e-3, "p = {}", enriched[0].p_value);
    assert!(enriched[0].fold_change > 1.2);
}

#[test]
fn checkpoint_preserves_the_analyzed_dataset() {
    let (ds, _) = cluster_merged();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("analysis.ckpt");
    ds.save(&path).unwrap();
    let back = ScDataset::load(&path).unwrap();
    assert_eq!(back.obs_names, ds.obs_names);
    assert_eq!(back.obs_label("cluster").unwrap(), ds.obs_label("cluster").unwrap());
    assert_eq!(
        back.embedding("lsi").unwrap().dim(),
        ds.embedding("lsi").unwrap().dim()
    );
}

use anyhow::Result;
use bed_utils::bed::tree::BedTree;
use bed_utils::bed::{GenomicRange, Strand};
use indexmap::IndexMap;
use log::info;
use nalgebra_sparse::CsrMatrix;

use crate::dataset::{Assay, ScDataset};
use crate::genome::{parse_region_key, Transcript};
use crate::utils::{csr_from_rows, row_sums};

/// Distance upstream of the TSS folded into each gene's accessible region.
pub const DEFAULT_UPSTREAM: u64 = 2000;

/// Per-gene genomic regions: every transcript body extended upstream of its
/// TSS (strand aware), grouped by gene name in first-seen order.
pub fn gene_regions(
    transcripts: &[Transcript],
    upstream: u64,
) -> IndexMap<String, Vec<GenomicRange>> {
    let mut regions: IndexMap<String, Vec<GenomicRange>> = IndexMap::new();
    for t in transcripts {
        let (start, end) = match t.strand {
            Strand::Reverse => (t.start, t.end + upstream),
            _ => (t.start.saturating_sub(upstream), t.end),
        };
        regions
            .entry(t.gene_name.clone())
            .or_default()
            .push(GenomicRange::new(t.chrom.clone(), start, end));
    }
    regions
}

/// Normalize counts in place to `ln(1 + v * scale / row_total)`.
pub fn log_normalize(m: &mut CsrMatrix<f64>, scale: f64) {
    let totals = row_sums(m);
    for (i, mut row) in m.row_iter_mut().enumerate() {
        let total = totals[i].max(1.0);
        for v in row.values_mut() {
            *v = (1.0 + *v * scale / total).ln();
        }
    }
}

/// Summarize peak counts into a gene activity assay: each gene scores the
/// summed counts of peaks overlapping its transcripts (bodies plus
/// `upstream` bp), log-normalized per cell.
pub fn gene_activity(
    ds: &ScDataset,
    transcripts: &[Transcript],
    upstream: u64,
) -> Result<Assay> {
    let peaks_assay = ds.assay("peaks")?;
    let regions = gene_regions(transcripts, upstream);
    let gene_names: Vec<String> = regions.keys().cloned().collect();
    let tree: BedTree<usize> = regions
        .values()
        .enumerate()
        .flat_map(|(gi, rs)| rs.iter().map(move |r| (r.clone(), gi)))
        .collect();

    // peak column -> overlapping gene columns
    let peak_genes: Vec<Vec<usize>> = peaks_assay
        .features
        .iter()
        .map(|key| {
            let region = parse_region_key(key)?;
            let mut genes: Vec<usize> =
                tree.find(&region).map(|(_, &gi)| gi).collect();
            genes.sort_unstable();
            genes.dedup();
            Ok(genes)
        })
        .collect::<Result<_>>()?;
    let n_hit = peak_genes.iter().filter(|g| !g.is_empty()).count();
    info!(
        "{} of {} peaks overlap a gene region",
        n_hit,
        peak_genes.len()
    );

    let rows = peaks_assay.matrix.row_iter().map(|row| {
        let mut acc: IndexMap<usize, f64> = IndexMap::new();
        for (&peak, &v) in row.col_indices().iter().zip(row.values()) {
            for &gi in &peak_genes[peak] {
                *acc.entry(gi).or_insert(0.0) += v;
            }
        }
        acc.into_iter().collect::<Vec<_>>()
    });
    let mut matrix = csr_from_rows(rows, gene_names.len());
    log_normalize(&mut matrix, 1e4);
    Assay::new(gene_names, matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ScDataset;

    fn transcripts() -> Vec<Transcript> {
        vec![
            Transcript {
                transcript_id: "T1".into(),
                gene_id: "G1".into(),
                gene_name: "Alpha".into(),
                chrom: "chr1".into(),
                start: 5000,
                end: 8000,
                strand: Strand::Forward,
            },
            Transcript {
                transcript_id: "T2".into(),
                gene_id: "G2".into(),
                gene_name: "Beta".into(),
                chrom: "chr1".into(),
                start: 20000,
                end: 25000,
                strand: Strand::Reverse,
            },
        ]
    }

    fn peak_dataset() -> ScDataset {
        // peak 0 hits Alpha's upstream window, peak 1 hits Beta's body,
        // peak 2 hits nothing
        let features = vec![
            "chr1:3500-4000".to_string(),
            "chr1:24000-24500".to_string(),
            "chr1:50000-50500".to_string(),
        ];
        let matrix = csr_from_rows(
            vec![
                vec![(0, 3.0), (2, 5.0)],
                vec![(1, 2.0)],
            ],
            3,
        );
        ScDataset::new(
            vec!["AAA-1".into(), "CCC-1".into()],
            "peaks",
            Assay::new(features, matrix).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn strand_aware_gene_regions() {
        let regions = gene_regions(&transcripts(), 2000);
        assert_eq!(regions["Alpha"][0], GenomicRange::new("chr1", 3000, 8000));
        assert_eq!(regions["Beta"][0], GenomicRange::new("chr1", 20000, 27000));
    }

    #[test]
    fn peaks_map_to_genes() {
        let ds = peak_dataset();
        let assay = gene_activity(&ds, &transcripts(), 2000).unwrap();
        assert_eq!(assay.features, vec!["Alpha", "Beta"]);
        // cell 0 touched only Alpha, cell 1 only Beta
        assert_eq!(assay.matrix.row(0).col_indices(), &[0]);
        assert_eq!(assay.matrix.row(1).col_indices(), &[1]);
        for v in assay.matrix.values() {
            assert!(*v > 0.0 && v.is_finite());
        }
    }

    #[test]
    fn log_normalize_bounds() {
        let mut m = csr_from_rows(vec![vec![(0, 10.0), (1, 90.0)]], 2);
        log_normalize(&mut m, 100.0);
        assert!((m.row(0).values()[0] - (1.0f64 + 10.0).ln()).abs() < 1e-12);
        assert!((m.row(0).values()[1] - (1.0f64 + 90.0).ln()).abs() < 1e-12);
    }
}

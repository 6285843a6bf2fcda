use std::collections::HashMap;

use anyhow::{bail, Result};
use bed_utils::bed::{tree::BedTree, BEDLike, GenomicRange};
use log::info;

use crate::dataset::ScDataset;
use crate::fragments::Fragment;
use crate::genome::Transcript;
use crate::utils::quantile;

/// Half-width of the TSS window used for the enrichment signal.
const TSS_CENTER_HALF: u64 = 100;
/// The flanking windows sit 1900-2000 bp away from the TSS.
const TSS_FLANK_NEAR: u64 = 1900;
const TSS_FLANK_FAR: u64 = 2000;
/// Fragments shorter than one nucleosome footprint.
const SUBNUCLEOSOMAL_MAX: u64 = 147;
/// Mononucleosomal fragment size range.
const MONONUCLEOSOMAL_MAX: u64 = 294;

/// Per-cell quality-control metrics.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CellQc {
    pub n_fragment: u64,
    pub frac_duplicated: f64,
    pub frac_mitochondrial: f64,
    pub tss_enrichment: f64,
    pub nucleosome_signal: f64,
    pub frac_reads_in_peaks: f64,
    pub frac_blacklist: f64,
}

/// Names of the metric obs columns written by [`attach_qc_metrics`], in order.
pub const QC_COLUMNS: &[&str] = &[
    "n_fragment",
    "frac_duplicated",
    "frac_mitochondrial",
    "tss_enrichment",
    "nucleosome_signal",
    "frac_reads_in_peaks",
    "frac_blacklist",
];

#[derive(Default)]
struct CellAccumulator {
    n_unique: u64,
    n_total: u64,
    n_mito: u64,
    tss_center: u64,
    tss_flank: u64,
    subnucleosomal: u64,
    mononucleosomal: u64,
    in_peaks: u64,
    in_blacklist: u64,
}

impl CellAccumulator {
    fn update(
        &mut self,
        fragment: &Fragment,
        tss_center: &BedTree<()>,
        tss_flank: &BedTree<()>,
        peaks: &BedTree<()>,
        blacklist: &BedTree<()>,
    ) {
        self.n_total += fragment.count as u64;
        if matches!(fragment.chrom.as_str(), "chrM" | "M" | "MT") {
            self.n_mito += 1;
            return;
        }
        self.n_unique += 1;
        let size = fragment.len();
        if size < SUBNUCLEOSOMAL_MAX {
            self.subnucleosomal += 1;
        } else if size < MONONUCLEOSOMAL_MAX {
            self.mononucleosomal += 1;
        }
        if peaks.is_overlapped(fragment) {
            self.in_peaks += 1;
        }
        if blacklist.is_overlapped(fragment) {
            self.in_blacklist += 1;
        }
        for ins in fragment.to_insertions() {
            if tss_center.is_overlapped(&ins) {
                self.tss_center += 1;
            }
            if tss_flank.is_overlapped(&ins) {
                self.tss_flank += 1;
            }
        }
    }

    fn finish(self) -> CellQc {
        let unique = self.n_unique.max(1) as f64;
        // flank windows cover 200 bp in total versus 200 bp of center window;
        // the pseudocount keeps zero-flank cells finite
        let flank_rate = self.tss_flank as f64 + 0.5;
        CellQc {
            n_fragment: self.n_unique,
            frac_duplicated: if self.n_total == 0 {
                0.0
            } else {
                1.0 - (self.n_unique + self.n_mito) as f64 / self.n_total as f64
            },
            frac_mitochondrial: self.n_mito as f64
                / (self.n_unique + self.n_mito).max(1) as f64,
            tss_enrichment: self.tss_center as f64 / flank_rate,
            nucleosome_signal: self.mononucleosomal as f64
                / self.subnucleosomal.max(1) as f64,
            frac_reads_in_peaks: self.in_peaks as f64 / unique,
            frac_blacklist: self.in_blacklist as f64 / unique,
        }
    }
}

fn tss_windows(transcripts: &[Transcript]) -> (BedTree<()>, BedTree<()>) {
    let centers: BedTree<()> = transcripts
        .iter()
        .map(|t| {
            let tss = t.tss();
            (
                GenomicRange::new(
                    t.chrom.clone(),
                    tss.saturating_sub(TSS_CENTER_HALF),
                    tss + TSS_CENTER_HALF + 1,
                ),
                (),
            )
        })
        .collect();
    let flanks: BedTree<()> = transcripts
        .iter()
        .flat_map(|t| {
            let tss = t.tss();
            [
                GenomicRange::new(
                    t.chrom.clone(),
                    tss.saturating_sub(TSS_FLANK_FAR),
                    tss.saturating_sub(TSS_FLANK_NEAR).max(1),
                ),
                GenomicRange::new(t.chrom.clone(), tss + TSS_FLANK_NEAR, tss + TSS_FLANK_FAR),
            ]
            .into_iter()
            .map(|r| (r, ()))
        })
        .collect();
    (centers, flanks)
}

/// Compute per-cell QC metrics from one streaming pass over a fragment
/// iterator. Fragments may arrive in any order.
pub fn compute_qc_metrics<I>(
    fragments: I,
    transcripts: &[Transcript],
    peaks: &[GenomicRange],
    blacklist: &[GenomicRange],
) -> Result<HashMap<String, CellQc>>
where
    I: Iterator<Item = Result<Fragment>>,
{
    let (tss_center, tss_flank) = tss_windows(transcripts);
    let peak_tree: BedTree<()> = peaks.iter().map(|r| (r.clone(), ())).collect();
    let blacklist_tree: BedTree<()> = blacklist.iter().map(|r| (r.clone(), ())).collect();

    let mut cells: HashMap<String, CellAccumulator> = HashMap::new();
    let mut n = 0u64;
    for fragment in fragments {
        let fragment = fragment?;
        if fragment.is_empty() {
            continue;
        }
        cells
            .entry(fragment.barcode.clone())
            .or_default()
            .update(&fragment, &tss_center, &tss_flank, &peak_tree, &blacklist_tree);
        n += 1;
    }
    info!("scanned {} fragments across {} barcodes", n, cells.len());
    Ok(cells.into_iter().map(|(k, v)| (k, v.finish())).collect())
}

/// Attach QC metrics to the dataset's obs table, aligned on barcode.
/// Barcodes without fragment records get NaN metrics (and therefore never
/// survive [`apply_qc_filter`]).
pub fn attach_qc_metrics(ds: &mut ScDataset, metrics: &HashMap<String, CellQc>) -> Result<()> {
    let mut columns: Vec<Vec<f64>> = vec![Vec::with_capacity(ds.n_cells()); QC_COLUMNS.len()];
    for bc in &ds.obs_names {
        match metrics.get(bc) {
            Some(qc) => {
                columns[0].push(qc.n_fragment as f64);
                columns[1].push(qc.frac_duplicated);
                columns[2].push(qc.frac_mitochondrial);
                columns[3].push(qc.tss_enrichment);
                columns[4].push(qc.nucleosome_signal);
                columns[5].push(qc.frac_reads_in_peaks);
                columns[6].push(qc.frac_blacklist);
            }
            None => columns.iter_mut().for_each(|c| c.push(f64::NAN)),
        }
    }
    for (name, values) in QC_COLUMNS.iter().zip(columns) {
        ds.add_obs_numeric(name, values)?;
    }
    Ok(())
}

/// Data-derived quantile bounds for one metric.
#[derive(Debug, Clone, Copy)]
pub struct QuantileBounds {
    pub lower: f64,
    pub upper: f64,
}

/// Keep cells lying within the `[lower_q, upper_q]` quantile bounds of every
/// listed metric. Returns the kept indices (ascending); the dataset is
/// subset in place. Cells with a non-finite value in any metric are dropped.
pub fn apply_qc_filter(
    ds: &mut ScDataset,
    metrics: &[&str],
    lower_q: f64,
    upper_q: f64,
) -> Result<Vec<usize>> {
    if !(0.0..=1.0).contains(&lower_q) || !(0.0..=1.0).contains(&upper_q) || lower_q >= upper_q {
        bail!("invalid quantile bounds [{}, {}]", lower_q, upper_q);
    }
    let mut keep = vec![true; ds.n_cells()];
    for metric in metrics {
        let values = ds.obs_numeric(metric)?;
        let lower = quantile(values, lower_q);
        let upper = quantile(values, upper_q);
        let (Some(lower), Some(upper)) = (lower, upper) else {
            bail!("metric '{}' has no finite values", metric);
        };
        info!(
            "QC bounds for {}: [{:.4}, {:.4}]",
            metric, lower, upper
        );
        for (i, &v) in values.iter().enumerate() {
            if !v.is_finite() || v < lower || v > upper {
                keep[i] = false;
            }
        }
    }
    let kept: Vec<usize> = keep
        .iter()
        .enumerate()
        .filter_map(|(i, &k)| k.then_some(i))
        .collect();
    info!(
        "QC filter kept {} of {} cells",
        kept.len(),
        ds.n_cells()
    );
    ds.subset_cells(&kept)?;
    Ok(kept)
}

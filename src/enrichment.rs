use anyhow::{bail, Result};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{DiscreteCDF, Hypergeometric};

use crate::motif::MotifAnnotation;
use crate::utils::MatchedBins;

pub const DEFAULT_BACKGROUND_DRAWS: usize = 50_000;
const MATCH_BINS: usize = 10;

#[derive(Debug, Clone)]
pub struct EnrichmentResult {
    pub motif_id: String,
    pub motif_name: String,
    /// Motif frequency in the query set over its frequency in the matched
    /// background (pseudocounted).
    pub fold_change: f64,
    pub p_value: f64,
    pub adj_p_value: f64,
    pub query_hits: u64,
    pub background_hits: u64,
}

/// Draws a background peak set matched on GC content and log peak length.
/// Each draw anchors at a random query peak and picks (with replacement) a
/// peak from the same covariate bin, so the background reproduces the
/// query's joint covariate distribution.
pub fn matched_background(
    query: &[usize],
    gc: &[f64],
    lengths: &[f64],
    n_draws: usize,
    seed: u64,
) -> Result<Vec<usize>> {
    if gc.len() != lengths.len() {
        bail!("{} GC values but {} lengths", gc.len(), lengths.len());
    }
    check_query(query, gc.len())?;
    if n_draws == 0 {
        bail!("need at least one background draw");
    }
    let log_len: Vec<f64> = lengths.iter().map(|&l| (1.0 + l).ln()).collect();
    let bins = MatchedBins::new(gc, &log_len, MATCH_BINS);
    let mut rng = StdRng::seed_from_u64(seed);
    Ok((0..n_draws)
        .map(|_| {
            let anchor = query[rng.gen_range(0..query.len())];
            bins.sample_match(anchor, &mut rng)
        })
        .collect())
}

fn check_query(query: &[usize], n_peaks: usize) -> Result<()> {
    if query.is_empty() {
        bail!("empty query peak set");
    }
    if let Some(&bad) = query.iter().find(|&&j| j >= n_peaks) {
        bail!("query peak index {} out of range ({})", bad, n_peaks);
    }
    Ok(())
}

fn motif_hits(annotation: &MotifAnnotation, peaks: &[usize]) -> Vec<u64> {
    let mut hits = vec![0u64; annotation.motif_ids.len()];
    for &j in peaks {
        for &m in annotation.incidence.row(j).col_indices() {
            hits[m] += 1;
        }
    }
    hits
}

/// Hypergeometric motif over-representation in a query peak set against a
/// background matched on GC content and log peak length, so covariate-driven
/// motif enrichment cancels out. Results are BH-adjusted and sorted by
/// adjusted then raw p-value.
pub fn motif_enrichment(
    annotation: &MotifAnnotation,
    query: &[usize],
    gc: &[f64],
    lengths: &[f64],
    n_draws: usize,
    seed: u64,
) -> Result<Vec<EnrichmentResult>> {
    let n_peaks = annotation.incidence.nrows();
    if gc.len() != n_peaks || lengths.len() != n_peaks {
        bail!(
            "covariates cover {} / {} peaks but the annotation has {}",
            gc.len(),
            lengths.len(),
            n_peaks
        );
    }
    let mut query: Vec<usize> = query.to_vec();
    query.sort_unstable();
    query.dedup();
    let background = matched_background(&query, gc, lengths, n_draws, seed)?;
    let query_hits = motif_hits(annotation, &query);
    let background_hits = motif_hits(annotation, &background);
    let results = summarize(annotation, query_hits, background_hits, query.len(), n_draws);
    info!(
        "enrichment over {} motifs: {} query peaks, {} matched background draws",
        annotation.motif_ids.len(),
        query.len(),
        n_draws
    );
    Ok(results)
}

/// Over-representation of each motif in the query set against all remaining
/// peaks, without covariate matching.
pub fn motif_enrichment_all_peaks(
    annotation: &MotifAnnotation,
    query: &[usize],
) -> Result<Vec<EnrichmentResult>> {
    let n_peaks = annotation.incidence.nrows();
    check_query(query, n_peaks)?;
    let mut query: Vec<usize> = query.to_vec();
    query.sort_unstable();
    query.dedup();
    let rest: Vec<usize> = (0..n_peaks)
        .filter(|j| query.binary_search(j).is_err())
        .collect();
    if rest.is_empty() {
        bail!("the query covers every peak, nothing to compare against");
    }
    let query_hits = motif_hits(annotation, &query);
    let background_hits = motif_hits(annotation, &rest);
    let results = summarize(annotation, query_hits, background_hits, query.len(), rest.len());
    info!(
        "enrichment over {} motifs: {} query peaks vs {} remaining peaks",
        annotation.motif_ids.len(),
        query.len(),
        rest.len()
    );
    Ok(results)
}

fn summarize(
    annotation: &MotifAnnotation,
    query_hits: Vec<u64>,
    background_hits: Vec<u64>,
    n_query: usize,
    n_background: usize,
) -> Vec<EnrichmentResult> {
    let n_motifs = annotation.motif_ids.len();
    let nq = n_query as u64;
    let nd = n_background as u64;
    let p_values: Vec<f64> = (0..n_motifs)
        .map(|m| {
            let k = query_hits[m];
            let big_k = k + background_hits[m];
            if k == 0 || big_k == 0 {
                return 1.0;
            }
            match Hypergeometric::new(nq + nd, big_k, nq) {
                Ok(dist) => 1.0 - dist.cdf(k - 1),
                Err(_) => 1.0,
            }
        })
        .collect();
    let adjusted = adjustp::adjust(&p_values, adjustp::Procedure::BenjaminiHochberg);

    let mut results: Vec<EnrichmentResult> = (0..n_motifs)
        .map(|m| {
            let q_rate = (query_hits[m] as f64 + 0.5) / (nq as f64 + 1.0);
            let b_rate = (background_hits[m] as f64 + 0.5) / (nd as f64 + 1.0);
            EnrichmentResult {
                motif_id: annotation.motif_ids[m].clone(),
                motif_name: annotation.motif_names[m].clone(),
                fold_change: q_rate / b_rate,
                p_value: p_values[m],
                adj_p_value: adjusted[m],
                query_hits: query_hits[m],
                background_hits: background_hits[m],
            }
        })
        .collect();
    results.sort_by(|a, b| {
        (a.adj_p_value, a.p_value)
            .partial_cmp(&(b.adj_p_value, b.p_value))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results
}

/// Two-sample Kolmogorov-Smirnov statistic: the largest gap between the two
/// empirical CDFs.
pub fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut xa: Vec<f64> = a.to_vec();
    let mut xb: Vec<f64> = b.to_vec();
    xa.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    xb.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    let (na, nb) = (xa.len() as f64, xb.len() as f64);
    let (mut i, mut j) = (0usize, 0usize);
    let mut d: f64 = 0.0;
    while i < xa.len() && j < xb.len() {
        let x = xa[i].min(xb[j]);
        while i < xa.len() && xa[i] <= x {
            i += 1;
        }
        while j < xb.len() && xb[j] <= x {
            j += 1;
        }
        d = d.max((i as f64 / na - j as f64 / nb).abs());
    }
    d
}

use anyhow::{bail, Context, Result};
use bed_utils::bed::GenomicRange;
use itertools::Itertools;
use log::info;
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;

use crate::genome::Genome;
use crate::utils::csr_from_rows;

/// Background nucleotide frequencies (A, C, G, T) used to normalize match
/// scores.
#[derive(Debug, Clone)]
pub struct BackgroundProb(pub [f64; 4]);

impl Default for BackgroundProb {
    fn default() -> Self {
        BackgroundProb([0.25, 0.25, 0.25, 0.25])
    }
}

/// A position probability matrix with its JASPAR identifier.
#[derive(Debug, Clone)]
pub struct DnaMotif {
    pub id: String,
    pub name: String,
    pub probability: Vec<[f64; 4]>,
}

impl DnaMotif {
    pub fn size(&self) -> usize {
        self.probability.len()
    }

    /// The motif matching the opposite strand: positions reversed, bases
    /// complemented.
    pub fn revcomp(&self) -> Self {
        let probability = self
            .probability
            .iter()
            .rev()
            .map(|&[a, c, g, t]| [t, g, c, a])
            .collect();
        DnaMotif {
            id: self.id.clone(),
            name: self.name.clone(),
            probability,
        }
    }

    pub fn to_scanner(mut self, bg: BackgroundProb) -> DnaMotifScanner {
        self.add_pseudocount(1e-4);
        let cdf = ScoreCdf::new(&self, &bg);
        DnaMotifScanner {
            motif: self,
            cdf,
            background: bg,
        }
    }

    fn add_pseudocount(&mut self, pseudocount: f64) {
        for ps in self.probability.iter_mut() {
            for p in ps.iter_mut() {
                if *p == 0.0 {
                    *p = pseudocount;
                }
            }
            let s: f64 = ps.iter().sum();
            if s != 1.0 {
                for p in ps.iter_mut() {
                    *p /= s;
                }
            }
        }
    }

    /// For each prefix length, the best score any suffix can still add.
    fn optimal_scores_suffix(&self, bg: &BackgroundProb) -> Vec<f64> {
        let mut scores: Vec<f64> = self
            .probability
            .iter()
            .scan(0.0, |state, prob| {
                let (i, p) = prob
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                    .unwrap();
                *state += (p / bg.0[i]).ln();
                Some(*state)
            })
            .collect();
        let max = *scores.last().unwrap();
        for x in scores.iter_mut() {
            *x = max - *x;
        }
        scores
    }

    // No bound checks on seq; the caller guarantees start + size <= len.
    fn look_ahead_search(
        &self,
        bg: &BackgroundProb,
        remain_best: &[f64],
        seq: &[u8],
        start: usize,
        thres: f64,
    ) -> Option<(usize, f64)> {
        let n = self.size();
        let mut cur_pos = 0;
        let mut cur_match = 0.0;
        loop {
            let sc = match seq[cur_pos + start] {
                b'A' | b'a' => (self.probability[cur_pos][0] / bg.0[0]).ln(),
                b'C' | b'c' => (self.probability[cur_pos][1] / bg.0[1]).ln(),
                b'G' | b'g' => (self.probability[cur_pos][2] / bg.0[2]).ln(),
                b'T' | b't' => (self.probability[cur_pos][3] / bg.0[3]).ln(),
                // ambiguity codes score as neutral
                _ => 0.0,
            };
            cur_match += sc;
            let cur_best = cur_match + remain_best[cur_pos];
            if cur_best < thres {
                return None;
            } else if cur_pos >= n - 1 {
                return Some((start, cur_best));
            } else {
                cur_pos += 1;
            }
        }
    }
}

/// Parse motifs from a JASPAR PFM file:
///
/// ```text
/// >MA0004.1 Arnt
/// A  [  4 19  0  0  0  0 ]
/// C  [ 16  0 20  0  0  0 ]
/// G  [  0  1  0 20  0 20 ]
/// T  [  0  0  0  0 20  0 ]
/// ```
pub fn parse_jaspar(content: &str) -> Result<Vec<DnaMotif>> {
    let mut motifs = Vec::new();
    let mut lines = content.lines().filter(|l| !l.trim().is_empty()).peekable();
    while let Some(header) = lines.next() {
        let header = header.trim();
        let Some(rest) = header.strip_prefix('>') else {
            bail!("expected a '>' header line, found '{}'", header);
        };
        let mut fields = rest.split_ascii_whitespace();
        let id = fields
            .next()
            .with_context(|| format!("motif header '{}' has no identifier", header))?
            .to_string();
        let name = fields.next().unwrap_or(&id).to_string();

        let mut rows: [Vec<f64>; 4] = Default::default();
        for expected in ["A", "C", "G", "T"] {
            let line = lines
                .next()
                .with_context(|| format!("motif '{}': truncated count matrix", id))?;
            let line = line.trim();
            if !line.starts_with(expected) {
                bail!("motif '{}': expected a {} row, found '{}'", id, expected, line);
            }
            let counts: Vec<f64> = line[1..]
                .trim()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .split_ascii_whitespace()
                .map(|v| {
                    lexical::parse::<f64, _>(v)
                        .with_context(|| format!("motif '{}': bad count '{}'", id, v))
                })
                .collect::<Result<_>>()?;
            rows[base_index(expected)] = counts;
        }
        let width = rows[0].len();
        if width == 0 || rows.iter().any(|r| r.len() != width) {
            bail!("motif '{}': count rows differ in length", id);
        }
        let probability: Vec<[f64; 4]> = (0..width)
            .map(|j| {
                let col = [rows[0][j], rows[1][j], rows[2][j], rows[3][j]];
                let total: f64 = col.iter().sum();
                if total <= 0.0 {
                    bail!("motif '{}': empty count column {}", id, j);
                }
                Ok([
                    col[0] / total,
                    col[1] / total,
                    col[2] / total,
                    col[3] / total,
                ])
            })
            .collect::<Result<_>>()?;
        motifs.push(DnaMotif {
            id,
            name,
            probability,
        });
    }
    if motifs.is_empty() {
        bail!("no motifs found");
    }
    info!("parsed {} motifs", motifs.len());
    Ok(motifs)
}

fn base_index(b: &str) -> usize {
    match b {
        "A" => 0,
        "C" => 1,
        "G" => 2,
        _ => 3,
    }
}

#[derive(Debug, Clone)]
pub struct DnaMotifScanner {
    pub motif: DnaMotif,
    cdf: ScoreCdf,
    background: BackgroundProb,
}

impl DnaMotifScanner {
    /// Sites scoring above the `1 - pvalue` quantile of the background score
    /// distribution.
    pub fn find<'a>(&'a self, seq: &'a [u8], pvalue: f64) -> MotifSites<'a> {
        let thres = self.cdf.prob_inverse(1.0 - pvalue);
        MotifSites {
            motif: &self.motif,
            sigma: self.motif.optimal_scores_suffix(&self.background),
            background: &self.background,
            seq,
            cur_pos: 0,
            thres,
        }
    }
}

/// Approximate CDF of motif match scores under the background model,
/// computed by dynamic programming over binned score densities.
#[derive(Debug, Clone)]
struct ScoreCdf(Vec<(f64, f64)>);

impl ScoreCdf {
    fn new(motif: &DnaMotif, bg: &BackgroundProb) -> Self {
        struct ScoreGetter {
            lowest: f64,
            step: f64,
        }
        impl ScoreGetter {
            fn get_sc(&self, i: usize) -> f64 {
                (i as f64 + 0.5) * self.step + self.lowest
            }
        }

        let precision = 1e-5;
        let init = (vec![1.0], ScoreGetter { lowest: 0.0, step: 0.0 });
        let (accum, getter) = motif.probability.iter().fold(init, |(accum, getter), probs| {
            let normalized_probs: Vec<f64> = probs
                .iter()
                .zip(bg.0.iter())
                .map(|(p_fg, p_bg)| (p_fg / p_bg).ln())
                .collect();
            let (min_prob, max_prob) = normalized_probs.iter().minmax().into_option().unwrap();
            let lowest = getter.get_sc(
                accum.iter().enumerate().find(|(_, x)| **x != 0.0).unwrap().0,
            ) + min_prob;
            let highest = getter.get_sc(
                accum.iter().enumerate().rev().find(|(_, x)| **x != 0.0).unwrap().0,
            ) + max_prob;
            if lowest < highest {
                let num_bins = ((highest - lowest) / precision).ceil().min(200000.0) as usize;
                let step = (highest - lowest) / num_bins as f64;
                let mut new_accum = vec![0.0; num_bins];
                accum.into_iter().enumerate().for_each(|(i, v)| {
                    if v != 0.0 {
                        let sc = getter.get_sc(i);
                        normalized_probs.iter().zip(bg.0.iter()).for_each(|(p_norm, p_bg)| {
                            let idx = (((sc + p_norm - lowest) / step).floor() as usize)
                                .min(num_bins - 1);
                            new_accum[idx] += v * p_bg;
                        });
                    }
                });
                (new_accum, ScoreGetter { lowest, step })
            } else {
                (accum, getter)
            }
        });

        let cdf = accum
            .into_iter()
            .scan(0.0, |state, x| {
                *state += x;
                Some(*state)
            })
            .enumerate()
            .map(|(i, x)| (getter.get_sc(i), x))
            .chunk_by(|x| x.1)
            .into_iter()
            .flat_map(|(_, mut groups)| {
                let a = groups.next().unwrap();
                match groups.last() {
                    None => vec![a],
                    Some(b) => vec![a, b],
                }
            })
            .collect();
        ScoreCdf(cdf)
    }

    fn prob_inverse(&self, p: f64) -> f64 {
        let cdf = &self.0;
        let n = cdf.len();
        match cdf.binary_search_by(|x| x.1.partial_cmp(&p).unwrap()) {
            Ok(i) => cdf[i].0,
            Err(0) => cdf[0].0,
            Err(i) if i >= n => cdf[n - 1].0,
            Err(i) => {
                let (sc_a, p_a) = cdf[i - 1];
                let (sc_b, p_b) = cdf[i];
                let w1 = (p_b - p) / (p_b - p_a);
                let w2 = (p - p_a) / (p_b - p_a);
                w1 * sc_a + w2 * sc_b
            }
        }
    }
}

pub struct MotifSites<'a> {
    motif: &'a DnaMotif,
    sigma: Vec<f64>,
    background: &'a BackgroundProb,
    seq: &'a [u8],
    cur_pos: usize,
    thres: f64,
}

impl Iterator for MotifSites<'_> {
    type Item = (usize, f64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cur_pos + self.motif.size() >= self.seq.len() + 1 {
                return None;
            }
            let search_result = self.motif.look_ahead_search(
                self.background,
                &self.sigma,
                self.seq,
                self.cur_pos,
                self.thres,
            );
            self.cur_pos += 1;
            if search_result.is_some() {
                return search_result;
            }
        }
    }
}

/// A binary regions-by-motifs incidence matrix: entry (r, m) is 1 when motif
/// m has a site in region r on either strand at the given p-value cutoff.
pub struct MotifAnnotation {
    pub motif_ids: Vec<String>,
    pub motif_names: Vec<String>,
    pub incidence: CsrMatrix<f64>,
}

pub fn annotate_regions(
    regions: &[GenomicRange],
    genome: &Genome,
    motifs: Vec<DnaMotif>,
    pvalue: f64,
) -> Result<MotifAnnotation> {
    if !(0.0..1.0).contains(&pvalue) || pvalue <= 0.0 {
        bail!("motif p-value cutoff must be in (0, 1), got {}", pvalue);
    }
    let motif_ids: Vec<String> = motifs.iter().map(|m| m.id.clone()).collect();
    let motif_names: Vec<String> = motifs.iter().map(|m| m.name.clone()).collect();
    let scanners: Vec<(DnaMotifScanner, DnaMotifScanner)> = motifs
        .into_par_iter()
        .map(|m| {
            let rc = m.revcomp();
            (
                m.to_scanner(BackgroundProb::default()),
                rc.to_scanner(BackgroundProb::default()),
            )
        })
        .collect();

    let rows: Vec<Vec<(usize, f64)>> = regions
        .par_iter()
        .map(|region| {
            let Some(seq) = genome.fetch(region) else {
                return Vec::new();
            };
            scanners
                .iter()
                .enumerate()
                .filter_map(|(j, (fwd, rev))| {
                    let hit = fwd.find(seq, pvalue).next().is_some()
                        || rev.find(seq, pvalue).next().is_some();
                    hit.then_some((j, 1.0))
                })
                .collect()
        })
        .collect();
    let incidence = csr_from_rows(rows, motif_ids.len());
    info!(
        "annotated {} regions with {} motifs ({} sites total)",
        regions.len(),
        motif_ids.len(),
        incidence.nnz()
    );
    Ok(MotifAnnotation {
        motif_ids,
        motif_names,
        incidence,
    })
}

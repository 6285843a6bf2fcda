use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bed_utils::bed::{BEDLike, GenomicRange, Strand};
use indexmap::IndexMap;
use log::info;
use needletail::parse_fastx_file;
use regex::Regex;

use crate::fragments::open_text;

/// An in-memory genome sequence, indexed by chromosome name.
pub struct Genome {
    sequences: IndexMap<String, Vec<u8>>,
}

impl Genome {
    pub fn from_fasta(path: &Path) -> Result<Self> {
        let mut reader = parse_fastx_file(path)
            .with_context(|| format!("cannot open FASTA '{}'", path.display()))?;
        let mut sequences = IndexMap::new();
        while let Some(record) = reader.next() {
            let record = record.with_context(|| "malformed FASTA record")?;
            let id = std::str::from_utf8(record.id())?
                .split_ascii_whitespace()
                .next()
                .unwrap_or("")
                .to_string();
            sequences.insert(id, record.seq().into_owned());
        }
        if sequences.is_empty() {
            bail!("no sequences found in '{}'", path.display());
        }
        info!("read {} reference sequences", sequences.len());
        Ok(Genome { sequences })
    }

    pub fn from_sequences<I, S>(seqs: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: Into<String>,
    {
        Genome {
            sequences: seqs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn chrom_sizes(&self) -> impl Iterator<Item = (&str, u64)> {
        self.sequences.iter().map(|(k, v)| (k.as_str(), v.len() as u64))
    }

    /// Sequence of a genomic interval, clipped to the chromosome end.
    pub fn fetch<B: BEDLike>(&self, region: &B) -> Option<&[u8]> {
        let seq = self.sequences.get(region.chrom())?;
        let start = (region.start() as usize).min(seq.len());
        let end = (region.end() as usize).min(seq.len());
        Some(&seq[start..end])
    }

    /// GC fraction of a genomic interval; `None` for unknown chromosomes or
    /// all-N intervals.
    pub fn gc_content<B: BEDLike>(&self, region: &B) -> Option<f64> {
        let seq = self.fetch(region)?;
        let mut gc = 0usize;
        let mut acgt = 0usize;
        for &b in seq {
            match b {
                b'G' | b'g' | b'C' | b'c' => {
                    gc += 1;
                    acgt += 1;
                }
                b'A' | b'a' | b'T' | b't' => acgt += 1,
                _ => {}
            }
        }
        (acgt > 0).then(|| gc as f64 / acgt as f64)
    }
}

/// A transcript record from a GTF annotation. Coordinates are 0-based
/// half-open, converted from the 1-based GTF convention.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub transcript_id: String,
    pub gene_id: String,
    pub gene_name: String,
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub strand: Strand,
}

impl Transcript {
    /// Transcription start site (strand aware).
    pub fn tss(&self) -> u64 {
        match self.strand {
            Strand::Reverse => self.end - 1,
            _ => self.start,
        }
    }
}

/// Read `transcript` records from a GTF annotation. Attributes are extracted
/// with a permissive `key "value"` pattern; `gene_name` falls back to
/// `gene_id` when absent.
pub fn read_transcripts_from_gtf<R: BufRead>(input: R) -> Result<Vec<Transcript>> {
    let attr_re = Regex::new(r#"(\w+) "([^"]*)""#).unwrap();
    let mut transcripts = Vec::new();
    for (i, line) in input.lines().enumerate() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 9 {
            bail!("GTF line {}: expected 9 fields, found {}", i + 1, fields.len());
        }
        if fields[2] != "transcript" {
            continue;
        }
        let start: u64 = lexical::parse(fields[3])
            .with_context(|| format!("GTF line {}: bad start", i + 1))?;
        let end: u64 = lexical::parse(fields[4])
            .with_context(|| format!("GTF line {}: bad end", i + 1))?;
        let strand = match fields[6] {
            "+" => Strand::Forward,
            "-" => Strand::Reverse,
            s => bail!("GTF line {}: transcript without strand: '{}'", i + 1, s),
        };
        let mut attrs: HashMap<&str, &str> = HashMap::new();
        for cap in attr_re.captures_iter(fields[8]) {
            attrs.insert(
                cap.get(1).unwrap().as_str(),
                cap.get(2).unwrap().as_str(),
            );
        }
        let transcript_id = attrs
            .get("transcript_id")
            .with_context(|| format!("GTF line {}: missing transcript_id", i + 1))?
            .to_string();
        let gene_id = attrs
            .get("gene_id")
            .with_context(|| format!("GTF line {}: missing gene_id", i + 1))?
            .to_string();
        let gene_name = attrs
            .get("gene_name")
            .map(|x| x.to_string())
            .unwrap_or_else(|| gene_id.clone());
        transcripts.push(Transcript {
            transcript_id,
            gene_id,
            gene_name,
            chrom: fields[0].to_string(),
            start: start - 1,
            end,
            strand,
        });
    }
    info!("read {} transcripts", transcripts.len());
    Ok(transcripts)
}

pub fn read_transcripts(path: &Path) -> Result<Vec<Transcript>> {
    read_transcripts_from_gtf(open_text(path)?)
}

/// Read BED3+ intervals (e.g. a blacklist or a peak set).
pub fn read_bed_regions(path: &Path) -> Result<Vec<GenomicRange>> {
    let reader = open_text(path)?;
    let mut regions = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') || line.starts_with("track") {
            continue;
        }
        let mut fields = line.split('\t');
        let chrom = fields
            .next()
            .with_context(|| format!("{}:{}: missing chrom", path.display(), i + 1))?;
        let start: u64 = fields
            .next()
            .and_then(|s| lexical::parse::<u64, _>(s).ok())
            .with_context(|| format!("{}:{}: bad start", path.display(), i + 1))?;
        let end: u64 = fields
            .next()
            .and_then(|s| lexical::parse::<u64, _>(s).ok())
            .with_context(|| format!("{}:{}: bad end", path.display(), i + 1))?;
        regions.push(GenomicRange::new(chrom, start, end));
    }
    Ok(regions)
}

/// Parse a region key of the form `chr1:100-200` (the string form used for
/// assay feature names).
pub fn parse_region_key(key: &str) -> Result<GenomicRange> {
    let (chrom, coords) = key
        .rsplit_once(':')
        .with_context(|| format!("invalid region key '{}'", key))?;
    let (start, end) = coords
        .split_once('-')
        .with_context(|| format!("invalid region key '{}'", key))?;
    Ok(GenomicRange::new(
        chrom,
        lexical::parse(start).with_context(|| format!("invalid region key '{}'", key))?,
        lexical::parse(end).with_context(|| format!("invalid region key '{}'", key))?,
    ))
}

/// String form of a region, used as its feature name.
pub fn region_key<B: BEDLike>(region: &B) -> String {
    format!("{}:{}-{}", region.chrom(), region.start(), region.end())
}

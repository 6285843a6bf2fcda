use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use bed_utils::bed::{BEDLike, GenomicRange, ParseError, Score, Strand};
use flate2::read::MultiGzDecoder;

pub type CellBarcode = String;

/// A fragment from a single-cell ATAC-seq experiment: a genomic interval, the
/// cell barcode it came from, and the number of read pairs supporting it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub barcode: CellBarcode,
    pub count: u32,
    pub strand: Option<Strand>,
}

impl Fragment {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tn5 insertion sites. Paired fragments contribute both ends,
    /// single-ended ones only the 5' cut site.
    pub fn to_insertions(&self) -> Vec<GenomicRange> {
        match self.strand {
            None => vec![
                GenomicRange::new(self.chrom.clone(), self.start, self.start + 1),
                GenomicRange::new(self.chrom.clone(), self.end - 1, self.end),
            ],
            Some(Strand::Forward) => vec![GenomicRange::new(
                self.chrom.clone(),
                self.start,
                self.start + 1,
            )],
            Some(Strand::Reverse) => {
                vec![GenomicRange::new(self.chrom.clone(), self.end - 1, self.end)]
            }
        }
    }
}

impl BEDLike for Fragment {
    fn chrom(&self) -> &str {
        &self.chrom
    }
    fn set_chrom(&mut self, chrom: &str) -> &mut Self {
        self.chrom = chrom.to_string();
        self
    }
    fn start(&self) -> u64 {
        self.start
    }
    fn set_start(&mut self, start: u64) -> &mut Self {
        self.start = start;
        self
    }
    fn end(&self) -> u64 {
        self.end
    }
    fn set_end(&mut self, end: u64) -> &mut Self {
        self.end = end;
        self
    }
    fn name(&self) -> Option<&str> {
        Some(&self.barcode)
    }
    fn score(&self) -> Option<Score> {
        None
    }
    fn strand(&self) -> Option<Strand> {
        self.strand.clone()
    }
}

impl std::str::FromStr for Fragment {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split('\t');
        let chrom = fields
            .next()
            .ok_or(ParseError::MissingReferenceSequenceName)?
            .to_string();
        let start = fields
            .next()
            .ok_or(ParseError::MissingStartPosition)
            .and_then(|s| lexical::parse(s).map_err(ParseError::InvalidStartPosition))?;
        let end = fields
            .next()
            .ok_or(ParseError::MissingEndPosition)
            .and_then(|s| lexical::parse(s).map_err(ParseError::InvalidEndPosition))?;
        let barcode = fields.next().ok_or(ParseError::MissingName).map(|s| s.into())?;
        let count = fields.next().map_or(Ok(1), |s| {
            if s == "." {
                Ok(1)
            } else {
                lexical::parse(s).map_err(ParseError::InvalidStartPosition)
            }
        })?;
        let strand = fields.next().map_or(Ok(None), |s| {
            if s == "." {
                Ok(None)
            } else {
                s.parse().map(Some).map_err(ParseError::InvalidStrand)
            }
        })?;
        Ok(Fragment {
            chrom,
            start,
            end,
            barcode,
            count,
            strand,
        })
    }
}

/// Open a possibly gzip-compressed text file.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let file =
        File::open(path).with_context(|| format!("cannot open '{}'", path.display()))?;
    let reader: Box<dyn Read> = if path.extension().is_some_and(|x| x == "gz") {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// Stream fragments from a (block-)gzipped or plain TSV file. Comment lines
/// starting with '#' are skipped; malformed records abort with the line number.
pub fn read_fragments(path: &Path) -> Result<impl Iterator<Item = Result<Fragment>>> {
    let reader = open_text(path)?;
    let path = path.to_path_buf();
    Ok(reader
        .lines()
        .enumerate()
        .filter_map(move |(i, line)| match line {
            Err(e) => Some(Err(e.into())),
            Ok(l) => {
                if l.is_empty() || l.starts_with('#') {
                    None
                } else {
                    Some(l.parse::<Fragment>().map_err(|e| {
                        anyhow::anyhow!(
                            "{}:{}: malformed fragment record: {:?}",
                            path.display(),
                            i + 1,
                            e
                        )
                    }))
                }
            }
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fragment_line() {
        let f: Fragment = "chr1\t100\t250\tAAACGAA-1\t3".parse().unwrap();
        assert_eq!(f.chrom, "chr1");
        assert_eq!(f.start, 100);
        assert_eq!(f.end, 250);
        assert_eq!(f.barcode, "AAACGAA-1");
        assert_eq!(f.count, 3);
        assert!(f.strand.is_none());
        assert_eq!(f.len(), 150);
    }

    #[test]
    fn parse_fragment_defaults() {
        let f: Fragment = "chrM\t5\t80\tBC\t.\t+".parse().unwrap();
        assert_eq!(f.count, 1);
        assert_eq!(f.strand, Some(Strand::Forward));
        assert_eq!(f.to_insertions().len(), 1);
    }

    #[test]
    fn paired_fragment_has_two_insertions() {
        let f: Fragment = "chr2\t10\t60\tBC\t1".parse().unwrap();
        let ins = f.to_insertions();
        assert_eq!(ins.len(), 2);
        assert_eq!(ins[0].start(), 10);
        assert_eq!(ins[1].start(), 59);
    }

    #[test]
    fn read_fragment_file() {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::with_suffix(".tsv").unwrap();
        writeln!(tmp, "# comment").unwrap();
        writeln!(tmp, "chr1\t0\t100\tA\t1").unwrap();
        writeln!(tmp, "chr1\t50\t200\tB\t2").unwrap();
        tmp.flush().unwrap();
        let frags: Vec<_> = read_fragments(tmp.path())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[1].barcode, "B");
    }
}

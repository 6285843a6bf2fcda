use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::dataset::{Assay, ScDataset};
use crate::fragments::open_text;
use crate::genome::{read_bed_regions, region_key};

/// Read a MatrixMarket coordinate matrix (the 10x `matrix.mtx` layout:
/// features in rows, cells in columns).
pub fn read_matrix_market<R: BufRead>(reader: R) -> Result<CsrMatrix<f64>> {
    let mut lines = reader.lines();
    let header = lines
        .next()
        .context("empty MatrixMarket file")??;
    if !header.starts_with("%%MatrixMarket matrix coordinate") {
        bail!("not a MatrixMarket coordinate file: '{}'", header);
    }
    let mut dims: Option<(usize, usize, usize)> = None;
    let mut coo: Option<CooMatrix<f64>> = None;
    let mut seen = 0usize;
    for (i, line) in lines.enumerate() {
        let line = line?;
        if line.starts_with('%') || line.is_empty() {
            continue;
        }
        let mut fields = line.split_ascii_whitespace();
        match dims {
            None => {
                let nrows: usize = fields
                    .next()
                    .and_then(|s| lexical::parse(s).ok())
                    .with_context(|| format!("line {}: bad size header", i + 2))?;
                let ncols: usize = fields
                    .next()
                    .and_then(|s| lexical::parse(s).ok())
                    .with_context(|| format!("line {}: bad size header", i + 2))?;
                let nnz: usize = fields
                    .next()
                    .and_then(|s| lexical::parse(s).ok())
                    .with_context(|| format!("line {}: bad size header", i + 2))?;
                dims = Some((nrows, ncols, nnz));
                coo = Some(CooMatrix::new(nrows, ncols));
            }
            Some((nrows, ncols, _)) => {
                let r: usize = fields
                    .next()
                    .and_then(|s| lexical::parse(s).ok())
                    .with_context(|| format!("line {}: bad entry", i + 2))?;
                let c: usize = fields
                    .next()
                    .and_then(|s| lexical::parse(s).ok())
                    .with_context(|| format!("line {}: bad entry", i + 2))?;
                let v: f64 = fields
                    .next()
                    .and_then(|s| lexical::parse(s).ok())
                    .with_context(|| format!("line {}: bad entry", i + 2))?;
                if r == 0 || r > nrows || c == 0 || c > ncols {
                    bail!("line {}: entry ({}, {}) out of bounds", i + 2, r, c);
                }
                coo.as_mut().unwrap().push(r - 1, c - 1, v);
                seen += 1;
            }
        }
    }
    let (nrows, ncols, nnz) =
        dims.context("MatrixMarket file has no size header")?;
    if seen != nnz {
        bail!("expected {} entries, found {}", nnz, seen);
    }
    if nrows == 0 || ncols == 0 {
        bail!("empty matrix ({} x {})", nrows, ncols);
    }
    Ok(CsrMatrix::from(&coo.unwrap()))
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let reader = open_text(path)?;
    reader
        .lines()
        .map(|l| l.map_err(Into::into))
        .collect::<Result<Vec<_>>>()
}

fn find_input(dir: &Path, stem: &str) -> Result<std::path::PathBuf> {
    let plain = dir.join(stem);
    if plain.exists() {
        return Ok(plain);
    }
    let gz = dir.join(format!("{}.gz", stem));
    if gz.exists() {
        return Ok(gz);
    }
    bail!(
        "neither '{0}' nor '{0}.gz' found under '{1}'",
        stem,
        dir.display()
    )
}

/// Load a 10x-style peak-barcode matrix directory (`matrix.mtx[.gz]`,
/// `barcodes.tsv[.gz]`, `peaks.bed[.gz]`) into a dataset with a `"peaks"`
/// counts assay. The matrix is transposed to cells x peaks.
pub fn read_peak_matrix_dir(dir: &Path) -> Result<ScDataset> {
    let matrix = read_matrix_market(open_text(&find_input(dir, "matrix.mtx")?)?)?;
    let barcodes = read_lines(&find_input(dir, "barcodes.tsv")?)?;
    let peaks = read_bed_regions(&find_input(dir, "peaks.bed")?)?;
    if matrix.nrows() != peaks.len() {
        bail!(
            "matrix has {} feature rows but peaks.bed lists {} regions",
            matrix.nrows(),
            peaks.len()
        );
    }
    if matrix.ncols() != barcodes.len() {
        bail!(
            "matrix has {} cell columns but barcodes.tsv lists {} barcodes",
            matrix.ncols(),
            barcodes.len()
        );
    }
    let features: Vec<String> = peaks.iter().map(region_key).collect();
    let cells_by_peaks = matrix.transpose();
    info!(
        "loaded {} cells x {} peaks from '{}'",
        cells_by_peaks.nrows(),
        cells_by_peaks.ncols(),
        dir.display()
    );
    ScDataset::new(barcodes, "peaks", Assay::new(features, cells_by_peaks)?)
}

/// Merge numeric columns of a per-cell metadata CSV (e.g. the 10x
/// `singlecell.csv`) into the dataset's obs table, matching on barcode.
/// Cells absent from the table get NaN.
pub fn attach_cell_metadata(ds: &mut ScDataset, path: &Path) -> Result<()> {
    let reader = open_text(path)?;
    let mut lines = reader.lines();
    let header = lines
        .next()
        .with_context(|| format!("'{}' is empty", path.display()))??;
    let columns: Vec<String> = header.split(',').map(|x| x.trim().to_string()).collect();
    let barcode_idx = columns
        .iter()
        .position(|c| c == "barcode")
        .with_context(|| format!("'{}' has no 'barcode' column", path.display()))?;

    let mut table: HashMap<String, Vec<f64>> = HashMap::new();
    let mut coerced = vec![false; columns.len()];
    for (i, line) in lines.enumerate() {
        let line = line?;
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != columns.len() {
            bail!(
                "{}:{}: expected {} fields, found {}",
                path.display(),
                i + 2,
                columns.len(),
                fields.len()
            );
        }
        let mut values = Vec::with_capacity(columns.len() - 1);
        for (j, v) in fields.iter().enumerate() {
            if j == barcode_idx {
                continue;
            }
            match lexical::parse::<f64, _>(v) {
                Ok(x) => values.push(x),
                Err(_) => {
                    coerced[j] = true;
                    values.push(f64::NAN);
                }
            }
        }
        table.insert(fields[barcode_idx].to_string(), values);
    }
    for (j, &c) in coerced.iter().enumerate() {
        if c {
            log::warn!(
                "column '{}' in '{}' is not numeric, its values are read as NaN",
                columns[j],
                path.display()
            );
        }
    }

    let n_meta = columns.len() - 1;
    let mut merged: Vec<Vec<f64>> = vec![Vec::with_capacity(ds.n_cells()); n_meta];
    let mut missing = 0usize;
    for bc in &ds.obs_names {
        match table.get(bc) {
            Some(values) => {
                for (k, v) in values.iter().enumerate() {
                    merged[k].push(*v);
                }
            }
            None => {
                missing += 1;
                for col in merged.iter_mut() {
                    col.push(f64::NAN);
                }
            }
        }
    }
    if missing > 0 {
        log::warn!(
            "{} of {} barcodes missing from '{}'",
            missing,
            ds.n_cells(),
            path.display()
        );
    }
    let names: Vec<&String> = columns
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != barcode_idx)
        .map(|(_, c)| c)
        .collect();
    for (name, values) in names.into_iter().zip(merged) {
        ds.add_obs_numeric(name, values)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MTX: &str = "\
%%MatrixMarket matrix coordinate integer general
% metadata
3 2 4
1 1 5
2 1 1
3 2 2
1 2 7
";

    #[test]
    fn parse_matrix_market() {
        let m = read_matrix_market(MTX.as_bytes()).unwrap();
        assert_eq!(m.nrows(), 3);
        assert_eq!(m.ncols(), 2);
        assert_eq!(m.nnz(), 4);
        assert_eq!(m.row(0).values(), &[5.0, 7.0]);
    }

    #[test]
    fn reject_truncated_matrix() {
        let bad = "%%MatrixMarket matrix coordinate integer general\n3 2 4\n1 1 5\n";
        assert!(read_matrix_market(bad.as_bytes()).is_err());
        let not_mm = "3 2 4\n1 1 5\n";
        assert!(read_matrix_market(not_mm.as_bytes()).is_err());
    }

    #[test]
    fn load_peak_matrix_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("matrix.mtx"), MTX).unwrap();
        std::fs::write(dir.path().join("barcodes.tsv"), "AAA-1\nCCC-1\n").unwrap();
        std::fs::write(
            dir.path().join("peaks.bed"),
            "chr1\t0\t100\nchr1\t200\t300\nchr2\t0\t50\n",
        )
        .unwrap();
        let ds = read_peak_matrix_dir(dir.path()).unwrap();
        assert_eq!(ds.n_cells(), 2);
        let assay = ds.default_assay();
        assert_eq!(assay.n_features(), 3);
        assert_eq!(assay.features[2], "chr2:0-50");
        // transposed: cell 0 x peak 0 == 5
        assert_eq!(assay.matrix.row(0).values()[0], 5.0);
    }

    #[test]
    fn metadata_attaches_by_barcode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("matrix.mtx"), MTX).unwrap();
        std::fs::write(dir.path().join("barcodes.tsv"), "AAA-1\nCCC-1\n").unwrap();
        std::fs::write(
            dir.path().join("peaks.bed"),
            "chr1\t0\t100\nchr1\t200\t300\nchr2\t0\t50\n",
        )
        .unwrap();
        let mut ds = read_peak_matrix_dir(dir.path()).unwrap();

        let csv = dir.path().join("singlecell.csv");
        let mut f = std::fs::File::create(&csv).unwrap();
        writeln!(f, "barcode,passed_filters,duplicate").unwrap();
        writeln!(f, "CCC-1,120,4").unwrap();
        writeln!(f, "AAA-1,300,10").unwrap();
        attach_cell_metadata(&mut ds, &csv).unwrap();
        assert_eq!(ds.obs_numeric("passed_filters").unwrap(), &[300.0, 120.0]);
        assert_eq!(ds.obs_numeric("duplicate").unwrap(), &[10.0, 4.0]);
    }

    #[test]
    fn non_numeric_metadata_becomes_nan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("matrix.mtx"), MTX).unwrap();
        std::fs::write(dir.path().join("barcodes.tsv"), "AAA-1\nCCC-1\n").unwrap();
        std::fs::write(
            dir.path().join("peaks.bed"),
            "chr1\t0\t100\nchr1\t200\t300\nchr2\t0\t50\n",
        )
        .unwrap();
        let mut ds = read_peak_matrix_dir(dir.path()).unwrap();

        let csv = dir.path().join("singlecell.csv");
        let mut f = std::fs::File::create(&csv).unwrap();
        writeln!(f, "barcode,cell_type,reads").unwrap();
        writeln!(f, "AAA-1,T cell,300").unwrap();
        writeln!(f, "CCC-1,B cell,120").unwrap();
        attach_cell_metadata(&mut ds, &csv).unwrap();
        assert!(ds.obs_numeric("cell_type").unwrap().iter().all(|v| v.is_nan()));
        assert_eq!(ds.obs_numeric("reads").unwrap(), &[300.0, 120.0]);
    }
}

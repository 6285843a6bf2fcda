use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use polars::prelude::{CsvWriter, DataFrame, NamedFrom, SerWriter, Series};

use crate::dataset::ScDataset;
use crate::diff::DiffResult;
use crate::enrichment::EnrichmentResult;

fn write_csv(mut df: DataFrame, path: &Path) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("cannot create '{}'", path.display()))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut df)?;
    info!("wrote {} rows to '{}'", df.height(), path.display());
    Ok(())
}

/// Per-cell metadata table: barcode plus every obs column.
pub fn write_obs_table(ds: &ScDataset, path: &Path) -> Result<()> {
    write_csv(ds.to_obs_dataframe()?, path)
}

/// A 2D (or higher) embedding as a plot-ready table: barcode, one column per
/// dimension, and any obs label columns for coloring.
pub fn write_embedding_table(
    ds: &ScDataset,
    embedding_name: &str,
    label_cols: &[&str],
    path: &Path,
) -> Result<()> {
    let coords = ds.embedding(embedding_name)?;
    let mut columns = vec![Series::new("barcode", ds.obs_names.clone())];
    for j in 0..coords.ncols() {
        let dim: Vec<f64> = coords.column(j).to_vec();
        columns.push(Series::new(
            &format!("{}_{}", embedding_name, j + 1),
            dim,
        ));
    }
    for &name in label_cols {
        columns.push(Series::new(name, ds.obs_label(name)?.to_vec()));
    }
    write_csv(DataFrame::new(columns)?, path)
}

/// Differential accessibility results, one row per tested feature.
pub fn write_diff_table(results: &[DiffResult], path: &Path) -> Result<()> {
    let df = DataFrame::new(vec![
        Series::new("feature", results.iter().map(|r| r.id.clone()).collect::<Vec<_>>()),
        Series::new("log2_fc", results.iter().map(|r| r.effect).collect::<Vec<_>>()),
        Series::new("p_value", results.iter().map(|r| r.p_value).collect::<Vec<_>>()),
        Series::new(
            "adj_p_value",
            results.iter().map(|r| r.adj_p_value).collect::<Vec<_>>(),
        ),
        Series::new("pct_in", results.iter().map(|r| r.pct_in).collect::<Vec<_>>()),
        Series::new("pct_out", results.iter().map(|r| r.pct_out).collect::<Vec<_>>()),
    ])?;
    write_csv(df, path)
}

/// Motif enrichment results, one row per motif.
pub fn write_enrichment_table(results: &[EnrichmentResult], path: &Path) -> Result<()> {
    let df = DataFrame::new(vec![
        Series::new(
            "motif_id",
            results.iter().map(|r| r.motif_id.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "motif_name",
            results.iter().map(|r| r.motif_name.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            "fold_change",
            results.iter().map(|r| r.fold_change).collect::<Vec<_>>(),
        ),
        Series::new("p_value", results.iter().map(|r| r.p_value).collect::<Vec<_>>()),
        Series::new(
            "adj_p_value",
            results.iter().map(|r| r.adj_p_value).collect::<Vec<_>>(),
        ),
        Series::new(
            "query_hits",
            results.iter().map(|r| r.query_hits).collect::<Vec<_>>(),
        ),
        Series::new(
            "background_hits",
            results.iter().map(|r| r.background_hits).collect::<Vec<_>>(),
        ),
    ])?;
    write_csv(df, path)
}

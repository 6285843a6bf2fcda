use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use log::info;
use nalgebra_sparse::CsrMatrix;
use ndarray::Array2;
use polars::prelude::{DataFrame, NamedFrom, Series};
use serde::{Deserialize, Serialize};

use crate::utils::{select_rows, vstack};

/// A named cells-by-features matrix with its feature index.
#[derive(Serialize, Deserialize, Clone)]
pub struct Assay {
    pub features: Vec<String>,
    pub matrix: CsrMatrix<f64>,
}

impl Assay {
    pub fn new(features: Vec<String>, matrix: CsrMatrix<f64>) -> Result<Self> {
        if features.len() != matrix.ncols() {
            bail!(
                "assay has {} features but matrix has {} columns",
                features.len(),
                matrix.ncols()
            );
        }
        Ok(Assay { features, matrix })
    }

    pub fn n_features(&self) -> usize {
        self.features.len()
    }
}

/// A per-cell metadata column.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum MetaColumn {
    Numeric(Vec<f64>),
    Label(Vec<String>),
}

impl MetaColumn {
    pub fn len(&self) -> usize {
        match self {
            MetaColumn::Numeric(v) => v.len(),
            MetaColumn::Label(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn subset(&self, indices: &[usize]) -> MetaColumn {
        match self {
            MetaColumn::Numeric(v) => {
                MetaColumn::Numeric(indices.iter().map(|&i| v[i]).collect())
            }
            MetaColumn::Label(v) => {
                MetaColumn::Label(indices.iter().map(|&i| v[i].clone()).collect())
            }
        }
    }
}

/// The single-cell chromatin accessibility container: one or more assays
/// sharing a cell index, per-cell metadata, and low-dimensional embeddings.
/// Every pipeline stage adds to it; none restructures it.
#[derive(Serialize, Deserialize)]
pub struct ScDataset {
    pub obs_names: Vec<String>,
    assays: IndexMap<String, Assay>,
    obs: IndexMap<String, MetaColumn>,
    embeddings: IndexMap<String, Array2<f64>>,
    default_assay: String,
}

impl ScDataset {
    pub fn new(obs_names: Vec<String>, assay_name: &str, assay: Assay) -> Result<Self> {
        if assay.matrix.nrows() != obs_names.len() {
            bail!(
                "assay '{}' has {} rows but {} cell barcodes were given",
                assay_name,
                assay.matrix.nrows(),
                obs_names.len()
            );
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = obs_names.iter().find(|x| !seen.insert(x.as_str())) {
            bail!("duplicate cell barcode '{}'", dup);
        }
        let mut assays = IndexMap::new();
        assays.insert(assay_name.to_string(), assay);
        Ok(ScDataset {
            obs_names,
            assays,
            obs: IndexMap::new(),
            embeddings: IndexMap::new(),
            default_assay: assay_name.to_string(),
        })
    }

    pub fn n_cells(&self) -> usize {
        self.obs_names.len()
    }

    pub fn assay(&self, name: &str) -> Result<&Assay> {
        self.assays
            .get(name)
            .with_context(|| format!("no assay named '{}'", name))
    }

    pub fn default_assay(&self) -> &Assay {
        &self.assays[&self.default_assay]
    }

    pub fn default_assay_name(&self) -> &str {
        &self.default_assay
    }

    pub fn assay_names(&self) -> impl Iterator<Item = &str> {
        self.assays.keys().map(|x| x.as_str())
    }

    pub fn add_assay(&mut self, name: &str, assay: Assay) -> Result<()> {
        if assay.matrix.nrows() != self.n_cells() {
            bail!(
                "assay '{}' has {} rows, expected {} (assay matrices share the cell index)",
                name,
                assay.matrix.nrows(),
                self.n_cells()
            );
        }
        self.assays.insert(name.to_string(), assay);
        Ok(())
    }

    pub fn set_default_assay(&mut self, name: &str) -> Result<()> {
        if !self.assays.contains_key(name) {
            bail!("no assay named '{}'", name);
        }
        self.default_assay = name.to_string();
        Ok(())
    }

    pub fn add_obs_numeric(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        self.add_obs(name, MetaColumn::Numeric(values))
    }

    pub fn add_obs_label(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        self.add_obs(name, MetaColumn::Label(values))
    }

    fn add_obs(&mut self, name: &str, column: MetaColumn) -> Result<()> {
        if column.len() != self.n_cells() {
            bail!(
                "obs column '{}' has {} values, expected {}",
                name,
                column.len(),
                self.n_cells()
            );
        }
        self.obs.insert(name.to_string(), column);
        Ok(())
    }

    pub fn obs_numeric(&self, name: &str) -> Result<&[f64]> {
        match self.obs.get(name) {
            Some(MetaColumn::Numeric(v)) => Ok(v),
            Some(MetaColumn::Label(_)) => bail!("obs column '{}' is not numeric", name),
            None => bail!("no obs column named '{}'", name),
        }
    }

    pub fn obs_label(&self, name: &str) -> Result<&[String]> {
        match self.obs.get(name) {
            Some(MetaColumn::Label(v)) => Ok(v),
            Some(MetaColumn::Numeric(_)) => bail!("obs column '{}' is not categorical", name),
            None => bail!("no obs column named '{}'", name),
        }
    }

    pub fn obs_columns(&self) -> impl Iterator<Item = (&str, &MetaColumn)> {
        self.obs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn add_embedding(&mut self, name: &str, coords: Array2<f64>) -> Result<()> {
        if coords.nrows() != self.n_cells() {
            bail!(
                "embedding '{}' has {} rows, expected {}",
                name,
                coords.nrows(),
                self.n_cells()
            );
        }
        self.embeddings.insert(name.to_string(), coords);
        Ok(())
    }

    pub fn embedding(&self, name: &str) -> Result<&Array2<f64>> {
        self.embeddings
            .get(name)
            .with_context(|| format!("no embedding named '{}'", name))
    }

    /// Keep only the given cells (in the given order). Every assay, obs
    /// column and embedding is subset consistently.
    pub fn subset_cells(&mut self, indices: &[usize]) -> Result<()> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.n_cells()) {
            bail!("cell index {} out of range ({})", bad, self.n_cells());
        }
        let new_names: Vec<String> =
            indices.iter().map(|&i| self.obs_names[i].clone()).collect();
        self.obs_names = new_names;
        for assay in self.assays.values_mut() {
            assay.matrix = select_rows(&assay.matrix, indices);
        }
        for col in self.obs.values_mut() {
            *col = col.subset(indices);
        }
        for emb in self.embeddings.values_mut() {
            let rows: Vec<_> = indices.iter().map(|&i| emb.row(i).to_owned()).collect();
            let ncols = emb.ncols();
            let mut out = Array2::zeros((indices.len(), ncols));
            for (k, row) in rows.into_iter().enumerate() {
                out.row_mut(k).assign(&row);
            }
            *emb = out;
        }
        Ok(())
    }

    /// Concatenate per-sample datasets into one. The feature set of every
    /// shared assay must be identical across samples. Sample provenance goes
    /// to the obs column `"sample"`, and barcodes are prefixed with the
    /// sample label to stay unique.
    pub fn merge(datasets: Vec<ScDataset>, labels: &[&str]) -> Result<ScDataset> {
        if datasets.is_empty() {
            bail!("nothing to merge");
        }
        if datasets.len() != labels.len() {
            bail!(
                "{} datasets but {} sample labels",
                datasets.len(),
                labels.len()
            );
        }
        let assay_names: Vec<String> =
            datasets[0].assays.keys().cloned().collect();
        for (ds, label) in datasets.iter().zip(labels) {
            for name in &assay_names {
                let a = ds
                    .assays
                    .get(name)
                    .with_context(|| format!("sample '{}' is missing assay '{}'", label, name))?;
                if a.features != datasets[0].assays[name].features {
                    bail!(
                        "sample '{}': assay '{}' feature set differs; \
                         re-quantify all samples on a common feature set first",
                        label,
                        name
                    );
                }
            }
        }

        let obs_names: Vec<String> = datasets
            .iter()
            .zip(labels)
            .flat_map(|(ds, label)| {
                ds.obs_names
                    .iter()
                    .map(move |bc| format!("{}#{}", label, bc))
            })
            .collect();
        let sample_col: Vec<String> = datasets
            .iter()
            .zip(labels)
            .flat_map(|(ds, label)| std::iter::repeat(label.to_string()).take(ds.n_cells()))
            .collect();

        let mut assays = IndexMap::new();
        for name in &assay_names {
            let mats: Vec<&CsrMatrix<f64>> =
                datasets.iter().map(|ds| &ds.assays[name].matrix).collect();
            let merged = Assay::new(datasets[0].assays[name].features.clone(), vstack(&mats))?;
            assays.insert(name.clone(), merged);
        }

        // numeric obs columns shared by all samples survive the merge
        let mut obs = IndexMap::new();
        let shared: Vec<String> = datasets[0]
            .obs
            .keys()
            .filter(|k| {
                datasets.iter().all(|ds| {
                    matches!(
                        (ds.obs.get(*k), &datasets[0].obs[*k]),
                        (Some(MetaColumn::Numeric(_)), MetaColumn::Numeric(_))
                            | (Some(MetaColumn::Label(_)), MetaColumn::Label(_))
                    )
                })
            })
            .cloned()
            .collect();
        for key in shared {
            let col = match &datasets[0].obs[&key] {
                MetaColumn::Numeric(_) => MetaColumn::Numeric(
                    datasets
                        .iter()
                        .flat_map(|ds| match &ds.obs[&key] {
                            MetaColumn::Numeric(v) => v.iter().copied(),
                            _ => unreachable!(),
                        })
                        .collect(),
                ),
                MetaColumn::Label(_) => MetaColumn::Label(
                    datasets
                        .iter()
                        .flat_map(|ds| match &ds.obs[&key] {
                            MetaColumn::Label(v) => v.iter().cloned(),
                            _ => unreachable!(),
                        })
                        .collect(),
                ),
            };
            obs.insert(key, col);
        }
        obs.insert("sample".to_string(), MetaColumn::Label(sample_col));

        let default_assay = datasets[0].default_assay.clone();
        info!(
            "merged {} samples into {} cells",
            datasets.len(),
            obs_names.len()
        );
        Ok(ScDataset {
            obs_names,
            assays,
            obs,
            // per-sample embeddings are not comparable across samples
            embeddings: IndexMap::new(),
            default_assay,
        })
    }

    /// Per-cell metadata as a polars DataFrame (barcode plus every obs column).
    pub fn to_obs_dataframe(&self) -> Result<DataFrame> {
        let mut columns = vec![Series::new("barcode", self.obs_names.clone())];
        for (name, col) in &self.obs {
            columns.push(match col {
                MetaColumn::Numeric(v) => Series::new(name, v.clone()),
                MetaColumn::Label(v) => Series::new(name, v.clone()),
            });
        }
        Ok(DataFrame::new(columns)?)
    }

    /// Write a zstd-compressed checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("cannot create '{}'", path.display()))?;
        let encoder = zstd::stream::write::Encoder::new(BufWriter::new(file), 3)?.auto_finish();
        bincode::serialize_into(encoder, self)?;
        info!("checkpoint written to '{}'", path.display());
        Ok(())
    }

    /// Load a checkpoint written by [`ScDataset::save`].
    pub fn load(path: &Path) -> Result<ScDataset> {
        let file = File::open(path)
            .with_context(|| format!("cannot open '{}'", path.display()))?;
        let decoder = zstd::stream::read::Decoder::new(BufReader::new(file))?;
        let ds = bincode::deserialize_from(decoder)
            .with_context(|| format!("'{}' is not a valid checkpoint", path.display()))?;
        Ok(ds)
    }
}

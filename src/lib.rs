//! Single-cell chromatin accessibility analysis: 10x peak-matrix ingestion,
//! fragment-level quality control, TF-IDF/LSI embedding, graph clustering,
//! gene activity scoring, differential accessibility, and motif analysis
//! (annotation, per-cell deviation scores, and enrichment against matched
//! backgrounds).

pub mod clustering;
pub mod dataset;
pub mod deviations;
pub mod diff;
pub mod embedding;
pub mod enrichment;
pub mod export;
pub mod fragments;
pub mod gene_activity;
pub mod genome;
pub mod io;
pub mod knn;
pub mod motif;
pub mod qc;
pub mod utils;

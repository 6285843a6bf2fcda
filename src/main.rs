use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bed_utils::bed::{BEDLike, GenomicRange};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{style::ProgressStyle, ProgressBar, ProgressDrawTarget, ProgressIterator};
use log::info;

use atacsuite::clustering::{louvain, spectral_layout};
use atacsuite::dataset::ScDataset;
use atacsuite::deviations::{deviation_scores, DEFAULT_BACKGROUND_SETS};
use atacsuite::diff::{diff_test, diff_test_all_clusters, TestMethod};
use atacsuite::embedding::{lsi, select_top_features, tf_idf};
use atacsuite::enrichment::{
    motif_enrichment, motif_enrichment_all_peaks, DEFAULT_BACKGROUND_DRAWS,
};
use atacsuite::export::{
    write_diff_table, write_embedding_table, write_enrichment_table, write_obs_table,
};
use atacsuite::fragments::read_fragments;
use atacsuite::gene_activity::{gene_activity, DEFAULT_UPSTREAM};
use atacsuite::genome::{parse_region_key, read_bed_regions, read_transcripts, Genome};
use atacsuite::io::{attach_cell_metadata, read_peak_matrix_dir};
use atacsuite::knn::{approximate_nearest_neighbour_graph, nearest_neighbour_graph, similarity_graph};
use atacsuite::motif::{annotate_regions, parse_jaspar, MotifAnnotation};
use atacsuite::qc::{apply_qc_filter, attach_qc_metrics, compute_qc_metrics};
use atacsuite::utils::{row_sums, select_columns};

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
///
/// Single-cell ATAC-seq analysis: ingest 10x peak matrices, filter cells on
/// fragment-level QC, merge samples, embed with TF-IDF/LSI, cluster, score
/// gene activity, test differential accessibility, and analyze motifs.
///
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// load a 10x peak-barcode matrix directory into a checkpoint
    Import(ImportArgs),
    /// compute fragment-level QC metrics and filter cells
    Qc(QcArgs),
    /// concatenate per-sample checkpoints on a shared peak set
    Merge(MergeArgs),
    /// TF-IDF normalization and LSI embedding
    Embed(EmbedArgs),
    /// neighbour graph, Louvain communities, and a 2D layout
    Cluster(ClusterArgs),
    /// summarize peak counts into per-gene activity scores
    GeneActivity(GeneActivityArgs),
    /// differential accessibility between cell groups
    Diff(DiffArgs),
    /// motif annotation and per-cell deviation scores
    Motif(MotifArgs),
    /// motif over-representation in a peak set against a matched background
    Enrich(EnrichArgs),
    /// write per-cell metadata and embedding tables as CSV
    Export(ExportArgs),
}

#[derive(Args)]
struct ImportArgs {
    /// directory holding matrix.mtx[.gz], barcodes.tsv[.gz], peaks.bed[.gz]
    #[arg(short, long)]
    matrix_dir: PathBuf,

    /// optional per-barcode metadata CSV (e.g. 10x singlecell.csv)
    #[arg(long)]
    cell_metadata: Option<PathBuf>,

    /// output checkpoint
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct QcArgs {
    /// input checkpoint
    #[arg(short, long)]
    input: PathBuf,

    /// fragment file (TSV, possibly gzipped)
    #[arg(short, long)]
    fragments: PathBuf,

    /// GTF annotation for TSS enrichment
    #[arg(short, long)]
    gtf: PathBuf,

    /// optional blacklist BED
    #[arg(long)]
    blacklist: Option<PathBuf>,

    /// metrics to filter on
    #[arg(long, value_delimiter = ',',
          default_values_t = ["n_fragment".to_string(), "tss_enrichment".to_string()])]
    metrics: Vec<String>,

    /// lower quantile bound
    #[arg(long, default_value_t = 0.02)]
    lower_quantile: f64,

    /// upper quantile bound
    #[arg(long, default_value_t = 0.98)]
    upper_quantile: f64,

    /// output checkpoint
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct MergeArgs {
    /// input checkpoints, one per sample
    #[arg(short, long, num_args = 2..)]
    inputs: Vec<PathBuf>,

    /// sample labels, one per input
    #[arg(short, long, num_args = 2..)]
    labels: Vec<String>,

    /// output checkpoint
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct EmbedArgs {
    /// input checkpoint
    #[arg(short, long)]
    input: PathBuf,

    /// number of LSI components
    #[arg(short, long, default_value_t = 30)]
    rank: usize,

    /// drop features at or below this quantile of total accessibility
    #[arg(long, default_value_t = 0.05)]
    min_feature_quantile: f64,

    /// drop components with |depth correlation| above this
    #[arg(long, default_value_t = 0.9)]
    max_depth_correlation: f64,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// output checkpoint
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct ClusterArgs {
    /// input checkpoint (needs the `lsi` embedding)
    #[arg(short, long)]
    input: PathBuf,

    /// neighbours per cell
    #[arg(short, long, default_value_t = 20)]
    k: usize,

    /// Louvain resolution
    #[arg(short, long, default_value_t = 1.0)]
    resolution: f64,

    /// use the approximate HNSW neighbour search
    #[arg(long)]
    approximate: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// output checkpoint
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct GeneActivityArgs {
    /// input checkpoint
    #[arg(short, long)]
    input: PathBuf,

    /// GTF annotation
    #[arg(short, long)]
    gtf: PathBuf,

    /// bp upstream of the TSS folded into each gene region
    #[arg(long, default_value_t = DEFAULT_UPSTREAM)]
    upstream: u64,

    /// output checkpoint
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
#[clap(rename_all = "lowercase")]
enum DiffMethod {
    Logistic,
    Wilcoxon,
}

impl From<DiffMethod> for TestMethod {
    fn from(m: DiffMethod) -> TestMethod {
        match m {
            DiffMethod::Logistic => TestMethod::Logistic,
            DiffMethod::Wilcoxon => TestMethod::Wilcoxon,
        }
    }
}

#[derive(Args)]
struct DiffArgs {
    /// input checkpoint
    #[arg(short, long)]
    input: PathBuf,

    /// assay to test
    #[arg(short, long, default_value = "peaks")]
    assay: String,

    /// obs column defining the groups
    #[arg(long, default_value = "cluster")]
    group_col: String,

    /// test this group against --group2 (or the rest); when absent, every
    /// group is tested against the rest
    #[arg(long)]
    group1: Option<String>,

    #[arg(long)]
    group2: Option<String>,

    #[arg(long, value_enum, default_value_t = DiffMethod::Logistic)]
    method: DiffMethod,

    /// minimum detection fraction in either group
    #[arg(long, default_value_t = 0.05)]
    min_pct: f64,

    /// output CSV (used as a prefix when testing every group)
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct MotifArgs {
    /// input checkpoint
    #[arg(short, long)]
    input: PathBuf,

    /// reference genome FASTA
    #[arg(long)]
    fasta: PathBuf,

    /// JASPAR PFM file
    #[arg(long)]
    jaspar: PathBuf,

    /// per-site match p-value cutoff
    #[arg(long, default_value_t = 5e-5)]
    scan_pvalue: f64,

    /// number of matched background peak sets
    #[arg(long, default_value_t = DEFAULT_BACKGROUND_SETS)]
    background_sets: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// output checkpoint (gains a `motif` deviation assay)
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct EnrichArgs {
    /// input checkpoint (defines the peak universe)
    #[arg(short, long)]
    input: PathBuf,

    /// reference genome FASTA
    #[arg(long)]
    fasta: PathBuf,

    /// JASPAR PFM file
    #[arg(long)]
    jaspar: PathBuf,

    /// query peaks: a file with one region key (chr:start-end) per line
    #[arg(short, long)]
    query: PathBuf,

    /// per-site match p-value cutoff
    #[arg(long, default_value_t = 5e-5)]
    scan_pvalue: f64,

    /// matched background draws
    #[arg(long, default_value_t = DEFAULT_BACKGROUND_DRAWS)]
    draws: usize,

    /// compare against all remaining peaks instead of a matched background
    #[arg(long)]
    naive_background: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// output CSV
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct ExportArgs {
    /// input checkpoint
    #[arg(short, long)]
    input: PathBuf,

    /// directory receiving the CSV tables
    #[arg(short, long)]
    out_dir: PathBuf,

    /// embeddings to export alongside the obs table
    #[arg(long, value_delimiter = ',')]
    embeddings: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.commands {
        Commands::Import(args) => run_import(args),
        Commands::Qc(args) => run_qc(args),
        Commands::Merge(args) => run_merge(args),
        Commands::Embed(args) => run_embed(args),
        Commands::Cluster(args) => run_cluster(args),
        Commands::GeneActivity(args) => run_gene_activity(args),
        Commands::Diff(args) => run_diff(args),
        Commands::Motif(args) => run_motif(args),
        Commands::Enrich(args) => run_enrich(args),
        Commands::Export(args) => run_export(args),
    }
}

fn run_import(args: ImportArgs) -> Result<()> {
    let mut ds = read_peak_matrix_dir(&args.matrix_dir)?;
    if let Some(meta) = &args.cell_metadata {
        attach_cell_metadata(&mut ds, meta)?;
    }
    ds.save(&args.output)
}

fn run_qc(args: QcArgs) -> Result<()> {
    let mut ds = ScDataset::load(&args.input)?;
    let transcripts = read_transcripts(&args.gtf)?;
    let peaks = dataset_peaks(&ds)?;
    let blacklist = match &args.blacklist {
        Some(path) => read_bed_regions(path)?,
        None => Vec::new(),
    };
    let spinner = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr_with_hz(1))
        .with_style(
            ProgressStyle::with_template(
                "{spinner} Processed {human_pos} fragments in {elapsed} ({per_sec}) ...",
            )
            .unwrap(),
        );
    let fragments = read_fragments(&args.fragments)?.progress_with(spinner);
    let metrics = compute_qc_metrics(fragments, &transcripts, &peaks, &blacklist)?;
    attach_qc_metrics(&mut ds, &metrics)?;
    let metric_names: Vec<&str> = args.metrics.iter().map(|s| s.as_str()).collect();
    apply_qc_filter(&mut ds, &metric_names, args.lower_quantile, args.upper_quantile)?;
    ds.save(&args.output)
}

fn run_merge(args: MergeArgs) -> Result<()> {
    if args.inputs.len() != args.labels.len() {
        bail!(
            "{} inputs but {} labels",
            args.inputs.len(),
            args.labels.len()
        );
    }
    let datasets = args
        .inputs
        .iter()
        .map(|p| ScDataset::load(p))
        .collect::<Result<Vec<_>>>()?;
    let labels: Vec<&str> = args.labels.iter().map(|s| s.as_str()).collect();
    let merged = ScDataset::merge(datasets, &labels)?;
    merged.save(&args.output)
}

fn run_embed(args: EmbedArgs) -> Result<()> {
    let mut ds = ScDataset::load(&args.input)?;
    let counts = &ds.default_assay().matrix;
    let depths = row_sums(counts);
    let kept = select_top_features(counts, args.min_feature_quantile)?;
    let mut normalized = select_columns(counts, &kept);
    tf_idf(&mut normalized);
    let result = lsi(&normalized, &depths, args.rank, args.seed)?;
    info!(
        "depth correlations: {:?}",
        result
            .depth_correlation
            .iter()
            .map(|c| (c * 100.0).round() / 100.0)
            .collect::<Vec<_>>()
    );
    let trimmed = result.drop_depth_components(args.max_depth_correlation);
    ds.add_embedding("lsi_full", result.embedding)?;
    ds.add_embedding("lsi", trimmed)?;
    ds.save(&args.output)
}

fn run_cluster(args: ClusterArgs) -> Result<()> {
    let mut ds = ScDataset::load(&args.input)?;
    let embedding = ds.embedding("lsi")?;
    let distances = if args.approximate {
        approximate_nearest_neighbour_graph(embedding.view(), args.k)?
    } else {
        nearest_neighbour_graph(embedding.view(), args.k)?
    };
    let graph = similarity_graph(&distances);
    let labels = louvain(&graph, args.resolution, args.seed)?;
    let layout = spectral_layout(&graph, 2, args.seed)?;
    ds.add_obs_label("cluster", labels.iter().map(|l| l.to_string()).collect())?;
    ds.add_embedding("layout", layout)?;
    ds.save(&args.output)
}

fn run_gene_activity(args: GeneActivityArgs) -> Result<()> {
    let mut ds = ScDataset::load(&args.input)?;
    let transcripts = read_transcripts(&args.gtf)?;
    let assay = gene_activity(&ds, &transcripts, args.upstream)?;
    ds.add_assay("gene_activity", assay)?;
    ds.save(&args.output)
}

fn run_diff(args: DiffArgs) -> Result<()> {
    let ds = ScDataset::load(&args.input)?;
    match &args.group1 {
        Some(group1) => {
            let results = diff_test(
                &ds,
                &args.assay,
                &args.group_col,
                group1,
                args.group2.as_deref(),
                args.method.into(),
                args.min_pct,
            )?;
            write_diff_table(&results, &args.output)
        }
        None => {
            if args.group2.is_some() {
                bail!("--group2 requires --group1");
            }
            let all = diff_test_all_clusters(
                &ds,
                &args.assay,
                &args.group_col,
                args.method.into(),
                args.min_pct,
            )?;
            let stem = args.output.with_extension("");
            for (group, results) in all {
                let path = PathBuf::from(format!("{}_{}.csv", stem.display(), group));
                write_diff_table(&results, &path)?;
            }
            Ok(())
        }
    }
}

fn run_motif(args: MotifArgs) -> Result<()> {
    let mut ds = ScDataset::load(&args.input)?;
    let genome = Genome::from_fasta(&args.fasta)?;
    let (peaks, annotation) = annotate_dataset_peaks(&ds, &genome, &args.jaspar, args.scan_pvalue)?;
    let gc: Vec<f64> = peaks
        .iter()
        .map(|r| genome.gc_content(r).unwrap_or(f64::NAN))
        .collect();
    let deviations = deviation_scores(
        &ds.assay("peaks")?.matrix,
        &annotation,
        &gc,
        args.background_sets,
        args.seed,
    )?;
    ds.add_assay("motif", deviations)?;
    ds.save(&args.output)
}

fn run_enrich(args: EnrichArgs) -> Result<()> {
    let ds = ScDataset::load(&args.input)?;
    let genome = Genome::from_fasta(&args.fasta)?;
    let (peaks, annotation) = annotate_dataset_peaks(&ds, &genome, &args.jaspar, args.scan_pvalue)?;
    let gc: Vec<f64> = peaks
        .iter()
        .map(|r| genome.gc_content(r).unwrap_or(f64::NAN))
        .collect();
    let lengths: Vec<f64> = peaks
        .iter()
        .map(|r| r.end().saturating_sub(r.start()) as f64)
        .collect();

    let feature_index: HashMap<&str, usize> = ds
        .assay("peaks")?
        .features
        .iter()
        .enumerate()
        .map(|(i, f)| (f.as_str(), i))
        .collect();
    let query: Vec<usize> = std::fs::read_to_string(&args.query)
        .with_context(|| format!("cannot read '{}'", args.query.display()))?
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            feature_index
                .get(l.trim())
                .copied()
                .with_context(|| format!("query peak '{}' is not in the dataset", l.trim()))
        })
        .collect::<Result<_>>()?;

    let results = if args.naive_background {
        motif_enrichment_all_peaks(&annotation, &query)?
    } else {
        motif_enrichment(&annotation, &query, &gc, &lengths, args.draws, args.seed)?
    };
    write_enrichment_table(&results, &args.output)
}

fn run_export(args: ExportArgs) -> Result<()> {
    let ds = ScDataset::load(&args.input)?;
    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("cannot create '{}'", args.out_dir.display()))?;
    write_obs_table(&ds, &args.out_dir.join("obs.csv"))?;
    let labels: Vec<&str> = if ds.obs_label("cluster").is_ok() {
        vec!["cluster"]
    } else {
        Vec::new()
    };
    for name in &args.embeddings {
        let path = args.out_dir.join(format!("{}.csv", name));
        write_embedding_table(&ds, name, &labels, &path)?;
    }
    Ok(())
}

fn dataset_peaks(ds: &ScDataset) -> Result<Vec<GenomicRange>> {
    ds.assay("peaks")?
        .features
        .iter()
        .map(|key| parse_region_key(key))
        .collect()
}

fn annotate_dataset_peaks(
    ds: &ScDataset,
    genome: &Genome,
    jaspar: &PathBuf,
    scan_pvalue: f64,
) -> Result<(Vec<GenomicRange>, MotifAnnotation)> {
    let peaks = dataset_peaks(ds)?;
    let content = std::fs::read_to_string(jaspar)
        .with_context(|| format!("cannot read '{}'", jaspar.display()))?;
    let motifs = parse_jaspar(&content)?;
    let annotation = annotate_regions(&peaks, genome, motifs, scan_pvalue)?;
    Ok((peaks, annotation))
}

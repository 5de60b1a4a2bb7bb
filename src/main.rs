#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::uninlined_format_args)]

mod csv_reader;
mod ingest;
mod ml;
mod structs;

use clap::{Args as ClapArgs, Parser, Subcommand};
use env_logger::Env;
use ingest::IngestSchema;
use log::{info, warn};
use ml::pipeline::AnalysisConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use structs::{KMeansConfig, LipidError, LongTable, PersistOutcome, Result};

/// Lipidomics group comparison: reshape, summarize, test, FDR-correct and cluster
#[derive(Parser, Debug)]
#[command(name = "lipidstat")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Layout of the wide input table
#[derive(ClapArgs, Debug)]
struct SchemaArgs {
    /// Column holding the sample identifier
    #[arg(long, default_value = "Sample")]
    sample_column: String,

    /// Column holding the raw group code
    #[arg(long, default_value = "Group")]
    group_column: String,

    /// Covariate column carried into the long table (repeatable)
    #[arg(long = "covariate", default_values = ["Age", "BMI"])]
    covariates: Vec<String>,

    /// Carry no covariate columns
    #[arg(long, conflicts_with = "covariates")]
    no_covariates: bool,

    /// Character that marks single-analyte columns
    #[arg(long, default_value = ":")]
    analyte_delimiter: char,

    /// Group code mapping CODE=LABEL (give exactly two; default 0=Control, 1=Treatment)
    #[arg(long = "group-label", value_parser = parse_group_label)]
    group_labels: Vec<(String, String)>,

    /// Substitute for missing and zero measurements
    #[arg(long, default_value_t = ingest::DEFAULT_DETECTION_LIMIT)]
    detection_limit: f64,

    /// Treat input as TSV regardless of extension
    #[arg(long)]
    tsv: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read the wide table, reshape it and persist the long file
    Ingest {
        /// Input CSV/TSV spreadsheet export
        #[arg(short, long)]
        input: PathBuf,

        /// Long-form file, written only if it does not exist
        #[arg(short, long, default_value = "lipids_long.csv")]
        long_file: PathBuf,

        #[command(flatten)]
        schema: SchemaArgs,
    },

    /// Run the full workflow and write the report into an output directory
    Analyze {
        /// Input CSV/TSV spreadsheet export
        #[arg(short, long, required_unless_present = "from_long")]
        input: Option<PathBuf>,

        /// Long-form file, written only if it does not exist
        #[arg(short, long, default_value = "lipids_long.csv")]
        long_file: PathBuf,

        /// Start from an existing long file instead of the wide input
        #[arg(long, conflicts_with = "input")]
        from_long: Option<PathBuf>,

        /// Output directory for results
        #[arg(short, long, default_value = "./lipid_output")]
        output_dir: PathBuf,

        /// Number of clusters for K-means
        #[arg(short = 'k', long, default_value_t = 2)]
        clusters: usize,

        /// K-means random restarts
        #[arg(long, default_value_t = 25)]
        restarts: usize,

        /// Maximum Lloyd iterations per restart
        #[arg(long, default_value_t = 10)]
        max_iterations: usize,

        /// Seed for the K-means random number generator
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Substring selecting analytes for the box-plot grid
        #[arg(long, default_value = "PC")]
        lipid_filter: String,

        /// Box-plot panels per row
        #[arg(long, default_value_t = 4)]
        grid_columns: usize,

        /// Significance level
        #[arg(long, default_value_t = ml::hypothesis::DEFAULT_ALPHA)]
        alpha: f64,

        #[command(flatten)]
        schema: SchemaArgs,
    },
}

fn parse_group_label(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((code, label)) if !code.trim().is_empty() && !label.trim().is_empty() => {
            Ok((code.trim().to_string(), label.trim().to_string()))
        }
        _ => Err(format!("expected CODE=LABEL, got '{s}'")),
    }
}

impl SchemaArgs {
    fn to_schema(&self) -> Result<IngestSchema> {
        let defaults = IngestSchema::default();
        let group_labels = if self.group_labels.is_empty() {
            defaults.group_labels
        } else {
            self.group_labels.iter().cloned().collect::<BTreeMap<_, _>>()
        };
        let schema = IngestSchema {
            sample_column: self.sample_column.clone(),
            group_column: self.group_column.clone(),
            covariate_columns: if self.no_covariates {
                Vec::new()
            } else {
                self.covariates.clone()
            },
            analyte_delimiter: self.analyte_delimiter,
            group_labels,
            detection_limit: self.detection_limit,
        };
        schema.validate()?;
        Ok(schema)
    }
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Commands::Ingest {
            input,
            long_file,
            schema,
        }) => run_ingest(&input, &long_file, &schema).map(|_| ()),

        Some(Commands::Analyze {
            input,
            long_file,
            from_long,
            output_dir,
            clusters,
            restarts,
            max_iterations,
            seed,
            lipid_filter,
            grid_columns,
            alpha,
            schema,
        }) => {
            let config = AnalysisConfig {
                alpha,
                lipid_filter,
                grid_columns,
                kmeans: KMeansConfig {
                    k: clusters,
                    n_restarts: restarts,
                    max_iterations,
                    seed,
                },
            };
            let (table, source) = match (from_long, input) {
                (Some(path), _) => {
                    info!("Loading long table: {}", path.display());
                    (LongTable::from_file(&path)?, path)
                }
                (None, Some(input)) => (run_ingest(&input, &long_file, &schema)?, input),
                (None, None) => {
                    return Err(LipidError::Config(
                        "Either --input or --from-long is required".into(),
                    ))
                }
            };
            run_analyze(&table, &source, &output_dir, &config)
        }

        None => {
            eprintln!("No subcommand provided. Use 'lipidstat ingest' or 'lipidstat analyze'.");
            eprintln!("Run 'lipidstat --help' for usage information.");
            std::process::exit(1);
        }
    }
}

/// Run the ingestion stage
fn run_ingest(input: &Path, long_file: &Path, args: &SchemaArgs) -> Result<LongTable> {
    if !input.exists() {
        return Err(LipidError::Config(format!(
            "Input file not found: {}",
            input.display()
        )));
    }
    let schema = args.to_schema()?;

    info!("Ingesting: {}", input.display());
    let (table, outcome) = ingest::ingest(input, long_file, &schema, args.tsv)?;
    match outcome {
        PersistOutcome::Written => info!(
            "Wrote {} long rows to {}",
            table.len(),
            long_file.display()
        ),
        PersistOutcome::Skipped { stale } => {
            if stale {
                warn!(
                    "Kept existing {}; analysis uses the freshly ingested table",
                    long_file.display()
                );
            }
        }
    }
    Ok(table)
}

/// Run the analysis stages and write every output file
fn run_analyze(
    table: &LongTable,
    source: &Path,
    output_dir: &Path,
    config: &AnalysisConfig,
) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;

    info!("Running analysis pipeline...");
    let result = ml::pipeline::run_pipeline(table, config)?;

    info!("Drawing figures...");
    let figures = ml::pipeline::draw_figures(table, &result, config, output_dir);

    info!("Writing output files...");
    ml::output::write_summary_csv(output_dir, &result.summaries)?;
    ml::output::write_pvalues(output_dir, &result.hypotheses)?;
    ml::output::write_clusters(
        output_dir,
        &result.standardized,
        &result.clusters,
        result.pca.as_ref(),
    )?;
    ml::output::write_stats_json(output_dir, &result)?;
    let report = ml::output::build_report(&source.display().to_string(), &result, &figures);
    ml::output::write_report(output_dir, &report)?;

    info!("Output written to {}", output_dir.display());
    for file in ["summary.csv", "pvalues.csv", "clusters.csv", "stats.json", "report.md"]
        .iter()
        .chain(&figures)
    {
        info!("  - {file}");
    }

    Ok(())
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use nmr_qc::aggregate::BatchAggregator;
use nmr_qc::data::{export, loader};
use nmr_qc::qc::evaluate_batch;
use nmr_qc::Sop;

#[derive(Parser)]
#[command(name = "nmr-qc")]
#[command(about = "Calibrate and quality-check a batch of 1D NMR spectra against an SOP")]
struct Cli {
    /// SOP document (JSON)
    #[arg(long)]
    sop: PathBuf,
    /// Raw spectra (.parquet, .json or .csv)
    #[arg(long)]
    input: PathBuf,
    /// Directory for the exported tables and report data
    #[arg(long, default_value = "qc_output")]
    output: PathBuf,
    /// File name prefix of the exported files
    #[arg(long, default_value = "nmr")]
    prefix: String,
    /// Worker threads, defaults to all cores
    #[arg(long)]
    threads: Option<usize>,
    /// Print the summary only, write nothing
    #[arg(long, default_value_t = false)]
    no_export: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let sop = Sop::load(&cli.sop).with_context(|| format!("loading SOP {}", cli.sop.display()))?;
    let dataset = loader::load_file(&cli.input)
        .with_context(|| format!("loading spectra from {}", cli.input.display()))?;
    if dataset.is_empty() {
        warn!("{} holds no spectra", cli.input.display());
    }
    info!("{} spectra, {} metadata columns", dataset.len(), dataset.columns().len());
    for id in dataset.duplicate_ids() {
        warn!("{id} acquired more than once, later acquisitions are rejected");
    }

    let evaluation = evaluate_batch(&sop, dataset.spectra, cli.threads)?;
    let aggregated = BatchAggregator::new(&sop).aggregate(&evaluation)?;

    for row in &aggregated.summary.acquired {
        println!(
            "{:<22} total {:>4}  excluded {:>4}  failed QC {:>4}  passed {:>4}",
            row.sample_type, row.total, row.rejected, row.failed_qc, row.passed
        );
    }
    if let Some(details) = &aggregated.summary.study_exclusions {
        for d in details {
            println!("  {}: {}", d.sample_id, d.reason);
        }
    }
    println!(
        "{} samples retained, {} features selected",
        aggregated.report.n_samples, aggregated.report.n_features
    );

    if !cli.no_export {
        let files = export::export_dataset(&aggregated, &sop, &cli.output, &cli.prefix)?;
        println!("report data written to {}", files.report.display());
    }
    Ok(())
}

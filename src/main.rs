#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use std::process;

use snpyield::anomaly::Sidedness;
use snpyield::config::RunConfig;
use snpyield::data::load_studies;
use snpyield::gibbs::GibbsEngine;
use snpyield::pipeline::{AnalysisContext, PipelineError, PlatformEvaluation};
use snpyield::report;

#[derive(Parser)]
#[command(
    name = "snpyield",
    version,
    about = "Hierarchical platform model of post-QC SNP counts, with anomaly scoring",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Inputs shared by every subcommand.
#[derive(Args)]
struct RunArgs {
    /// Tab-separated study table (study, snps, platform, known_loci_excluded, ...)
    studies: PathBuf,

    /// TOML run configuration; must at least list the platform vocabulary
    #[arg(long)]
    config: PathBuf,

    /// Override the sampler seed from the configuration
    #[arg(long)]
    seed: Option<u64>,

    /// Override the number of sampler chains from the configuration
    #[arg(long)]
    chains: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the platform model and write posterior platform summaries
    Fit {
        #[command(flatten)]
        run: RunArgs,

        #[arg(long, default_value = "platform_summaries.tsv")]
        output: PathBuf,
    },

    /// Fit the model and overlay replicates on the first observations
    Check {
        #[command(flatten)]
        run: RunArgs,

        /// Long-format replicate table
        #[arg(long, default_value = "model_check.tsv")]
        output: PathBuf,

        /// One summary line per checked observation
        #[arg(long, default_value = "model_check_summary.tsv")]
        summary: PathBuf,
    },

    /// Score a hypothetical post-QC SNP count against the fitted platforms
    Evaluate {
        #[command(flatten)]
        run: RunArgs,

        /// Raw post-QC SNP count to score
        #[arg(long)]
        value: f64,

        /// Platform to score against; every vocabulary platform when omitted
        #[arg(long)]
        platform: Option<String>,

        /// Report the one-sided tail proportion instead of the configured sidedness
        #[arg(long)]
        one_sided: bool,

        #[arg(long, default_value = "evaluation.tsv")]
        output: PathBuf,
    },
}

/// Loads the configuration, applies command-line overrides, reads the study
/// table and fits the model once.
fn prepare(run: &RunArgs) -> Result<(RunConfig, AnalysisContext), PipelineError> {
    let mut config = RunConfig::load(&run.config)?;
    if let Some(seed) = run.seed {
        config.sampler.seed = seed;
    }
    if let Some(chains) = run.chains {
        config.sampler.chains = chains;
    }
    config.validate()?;

    let (table, filters) = load_studies(&run.studies, &config.filters)?;
    println!(
        "Loaded {} of {} studies from {}",
        filters.kept,
        filters.read,
        run.studies.display()
    );

    let engine = GibbsEngine::new(config.priors.clone());
    let context = AnalysisContext::fit(
        &table,
        config.vocabulary().clone(),
        &engine,
        &config.sampler,
        config.check.replicates,
    )?;
    Ok((config, context))
}

fn run_fit(run: RunArgs, output: &Path) -> Result<(), PipelineError> {
    let (_, context) = prepare(&run)?;
    let summaries = context.platform_summaries();
    for summary in &summaries {
        println!(
            "{}: {:.0} SNPs (95% interval {:.0} to {:.0})",
            summary.platform, summary.mean, summary.lower_95, summary.upper_95
        );
    }
    report::write_platform_summaries(report::create(output)?, &summaries, context.diagnostics())?;
    println!("Platform summaries written to {}", output.display());
    Ok(())
}

fn run_check(run: RunArgs, output: &Path, summary: &Path) -> Result<(), PipelineError> {
    let (config, context) = prepare(&run)?;
    let mut rng = StdRng::seed_from_u64(config.sampler.seed);
    let result = context.model_check(config.check.rows, &mut rng)?;
    report::write_model_check(report::create(output)?, &result, context.study_ids())?;
    report::write_model_check_summary(report::create(summary)?, &result, context.study_ids())?;
    println!(
        "{:.0}% of {} checked observations lie inside their central 90% predictive interval",
        100.0 * result.interval_coverage,
        result.rows.len()
    );
    println!(
        "Model check written to {} and {}",
        output.display(),
        summary.display()
    );
    Ok(())
}

fn run_evaluate(
    run: RunArgs,
    value: f64,
    platform: Option<String>,
    one_sided: bool,
    output: &Path,
) -> Result<(), PipelineError> {
    let (config, context) = prepare(&run)?;
    let sidedness = if one_sided {
        Sidedness::OneSided
    } else {
        config.evaluation.sidedness
    };

    let evaluations = match platform {
        Some(platform) => {
            let score = context.evaluate_seeded(&platform, value, sidedness, config.sampler.seed)?;
            vec![PlatformEvaluation { platform, score }]
        }
        None => context.evaluate_all(value, sidedness, config.sampler.seed)?,
    };

    for evaluation in &evaluations {
        println!(
            "{}: p = {:.4} ({}), {:.2} predictive SDs from the mean of {:.0}",
            evaluation.platform,
            evaluation.score.p_value,
            evaluation.score.sidedness,
            evaluation.score.sd_distance,
            evaluation.score.replicate_mean
        );
    }
    report::write_evaluations(report::create(output)?, &evaluations)?;
    println!("Evaluation written to {}", output.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Fit { run, output } => run_fit(run, &output),
        Commands::Check {
            run,
            output,
            summary,
        } => run_check(run, &output, &summary),
        Commands::Evaluate {
            run,
            value,
            platform,
            one_sided,
            output,
        } => run_evaluate(run, value, platform, one_sided, &output),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

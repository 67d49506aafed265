//! sva-patch CLI: activation patching for subject-verb agreement

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use sva_patch::{
    plot_patching_heatmap, Experiment, HeatmapOptions, MinimalPair, PairSet, PatchModel,
    PatchingConfig,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sva-patch")]
#[command(about = "Activation patching of attention heads for subject-verb agreement")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` (e.g., "gpt2")
    #[arg(short, long, default_value = "gpt2")]
    model: String,

    /// Clean sentence (plural subject)
    #[arg(long, requires = "corrupted", conflicts_with = "pairs")]
    clean: Option<String>,

    /// Corrupted sentence (singular subject)
    #[arg(long, requires = "clean")]
    corrupted: Option<String>,

    /// JSON file with minimal pairs or a pair generator spec
    #[arg(short, long)]
    pairs: Option<PathBuf>,

    /// JSON file with a PatchingConfig
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verb form agreeing with the clean subject
    #[arg(long)]
    correct: Option<String>,

    /// Verb form agreeing with the corrupted subject
    #[arg(long)]
    incorrect: Option<String>,

    /// Percentile threshold for critical heads
    #[arg(long)]
    percentile: Option<f64>,

    /// Patch heads in parallel
    #[arg(long)]
    parallel: bool,

    /// Output directory for results
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // CLI flags override the config file
    let mut config = match &cli.config {
        Some(path) => PatchingConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PatchingConfig::default(),
    };
    if let Some(correct) = cli.correct {
        config.target_correct = correct;
    }
    if let Some(incorrect) = cli.incorrect {
        config.target_incorrect = incorrect;
    }
    if let Some(percentile) = cli.percentile {
        config.percentile = percentile;
    }
    config.parallel |= cli.parallel;
    config.validate()?;

    let pairs: Vec<MinimalPair> = match (&cli.pairs, cli.clean, cli.corrupted) {
        (Some(path), _, _) => PairSet::load(path)
            .with_context(|| format!("Failed to load pairs from {}", path.display()))?
            .pairs()
            .to_vec(),
        (None, Some(clean), Some(corrupted)) => vec![MinimalPair::new(clean, corrupted)],
        _ => vec![MinimalPair::new("The cats near the dog", "The cat near the dog")],
    };

    println!("=== sva-patch: Activation Patching for Subject-Verb Agreement ===");
    println!("Model:   {}", cli.model);
    println!("Pairs:   {}", pairs.len());
    println!(
        "Targets: {:?} vs {:?}",
        config.target_correct, config.target_incorrect
    );
    println!("Output:  {}", cli.output.display());
    if cli.cpu {
        println!("Mode:    CPU (forced)");
    }

    // Load model
    info!("Loading model...");
    let model = PatchModel::from_pretrained_with_device(&cli.model, Some(cli.cpu))?;
    info!(
        "Model: {} layers, {} heads, {} hidden",
        model.n_layers(),
        model.n_heads(),
        model.d_model()
    );

    // Run experiment
    let percentile = config.percentile;
    let experiment = Experiment::new(model, config);
    let results = experiment.run(&pairs)?;

    // Print results
    println!("\n=== Results ===");
    for (i, pair_result) in results.per_pair.iter().enumerate() {
        println!(
            "Pair {:2}: clean {:+.3}, corrupted {:+.3}",
            i, pair_result.result.clean_logit_diff, pair_result.result.corrupted_logit_diff
        );
    }

    println!("\nTop heads (mean score):");
    for ranked in results.ranked_heads.iter().take(10) {
        println!(
            "  L{:2} H{:2}: {:+.4}",
            ranked.layer, ranked.head, ranked.score
        );
    }

    println!(
        "\n{} critical heads at the {}th percentile ({:.1}% coverage)",
        results.critical_heads.len(),
        percentile,
        results.coverage * 100.0
    );
    for (layer, heads) in &results.mask {
        println!("  layer {layer}: {heads:?}");
    }

    // Save results
    std::fs::create_dir_all(&cli.output)?;
    let results_path = cli.output.join("patching_results.json");
    std::fs::write(&results_path, serde_json::to_string_pretty(&results)?)?;
    info!("Results saved to {}", results_path.display());

    let heatmap_path = cli.output.join("patching_heatmap.png");
    plot_patching_heatmap(&results.mean_scores, &heatmap_path, &HeatmapOptions::default())
        .context("Failed to render heatmap")?;
    info!("Heatmap saved to {}", heatmap_path.display());

    Ok(())
}

mod checkpoint;
mod pipeline;
mod records;
mod regions;
mod settings;
mod tables;
mod wiki;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use checkpoint::Checkpoint;
use pipeline::EnrichmentPipeline;
use regions::RegionTable;
use settings::Settings;
use tables::{FailureWriter, RecordWriter};
use wiki::pageinfo::PageInfoClient;
use wiki::quality::QualityClient;

#[derive(Parser)]
#[command(
    name = "wp_quality",
    about = "Politician article quality by region, from Wikipedia page info and Lift Wing scores"
)]
struct Cli {
    /// Settings file (TOML). Defaults to ./wp_quality.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PathArgs {
    /// Roster CSV (name,url,country)
    #[arg(long, global = true)]
    roster: Option<PathBuf>,
    /// Population CSV (Geography,Population)
    #[arg(long, global = true)]
    population: Option<PathBuf>,
    /// Enriched output CSV
    #[arg(long, global = true)]
    output: Option<PathBuf>,
    /// Failure report CSV
    #[arg(long, global = true)]
    failures: Option<PathBuf>,
    /// Resume checkpoint (SQLite)
    #[arg(long, global = true)]
    checkpoint: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch revisions and quality scores, join regions, write the output
    Run {
        /// Only process the first N roster rows
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Do not read or write the checkpoint
        #[arg(long)]
        no_checkpoint: bool,
        /// Clear the checkpoint before starting
        #[arg(long, conflicts_with = "no_checkpoint")]
        fresh: bool,
    },
    /// Summarise the population hierarchy
    Regions,
    /// Show checkpoint contents
    Stats,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    apply_path_overrides(&mut settings, cli.paths);
    info!(settings = ?settings, "Settings loaded");

    let result = match cli.command {
        Commands::Run {
            limit,
            no_checkpoint,
            fresh,
        } => run(&settings, limit, no_checkpoint, fresh),
        Commands::Regions => regions_summary(&settings),
        Commands::Stats => checkpoint_stats(&settings),
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn apply_path_overrides(settings: &mut Settings, paths: PathArgs) {
    if let Some(p) = paths.roster {
        settings.roster_path = p;
    }
    if let Some(p) = paths.population {
        settings.population_path = p;
    }
    if let Some(p) = paths.output {
        settings.output_path = p;
    }
    if let Some(p) = paths.failures {
        settings.failures_path = p;
    }
    if let Some(p) = paths.checkpoint {
        settings.checkpoint_path = p;
    }
}

fn load_regions(settings: &Settings) -> anyhow::Result<RegionTable> {
    let rows = tables::load_population(&settings.population_path)
        .with_context(|| format!("Failed to read {:?}", settings.population_path))?;
    let table = RegionTable::parse(rows)?;
    info!(
        regions = table.regions().len(),
        countries = table.country_count(),
        "Population hierarchy parsed"
    );
    Ok(table)
}

fn run(
    settings: &Settings,
    limit: Option<usize>,
    no_checkpoint: bool,
    fresh: bool,
) -> anyhow::Result<()> {
    // All configuration is checked before the first request goes out.
    let credentials = settings.credentials()?;
    let pageinfo_config = settings.pageinfo_config()?;
    let quality_config = settings.quality_config()?;
    info!(
        contact = credentials.contact().as_str(),
        pageinfo_delay_ms = pageinfo_config.delay.as_millis() as u64,
        quality_delay_ms = quality_config.delay.as_millis() as u64,
        "Throttles configured"
    );

    let table = load_regions(settings)?;

    let mut roster = tables::load_roster(&settings.roster_path)
        .with_context(|| format!("Failed to read {:?}", settings.roster_path))?;
    if let Some(n) = limit {
        roster.truncate(n);
    }
    if roster.is_empty() {
        println!("Roster is empty, nothing to do.");
        return Ok(());
    }

    let checkpoint = if no_checkpoint {
        None
    } else {
        let cp = Checkpoint::open(&settings.checkpoint_path)
            .with_context(|| format!("Failed to open {:?}", settings.checkpoint_path))?;
        if fresh {
            cp.clear()?;
        }
        Some(cp)
    };

    let pages = PageInfoClient::new(pageinfo_config)?;
    let scores = QualityClient::new(quality_config)?;

    let pb = ProgressBar::new(roster.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let mut pipeline =
        EnrichmentPipeline::new(&pages, &scores, &credentials, &table).with_progress(pb);
    if let Some(cp) = &checkpoint {
        pipeline = pipeline.with_checkpoint(cp);
    }

    println!("Enriching {} politicians ({})...", roster.len(), pipeline.run_id());
    let outcome = pipeline.run(&roster)?;
    debug_assert!(outcome.is_complete_for(roster.len()));

    let by_stage = outcome.failures_by_stage();
    let unmatched = tables::unmatched_countries(&outcome.failures);

    ensure_parent(&settings.failures_path)?;
    FailureWriter::create(&settings.failures_path)?.write(&outcome.failures)?;
    let countries_path = unmatched_countries_path(&settings.failures_path);
    tables::write_lines(&countries_path, &unmatched)?;

    let successes = outcome.successes.len();
    ensure_parent(&settings.output_path)?;
    RecordWriter::create(&settings.output_path)?.write(outcome.successes)?;

    println!("Successes: {}", successes);
    println!("Failures:  {}", outcome.failures.len());
    for (stage, count) in &by_stage {
        println!("  {:<14} {}", stage.as_str(), count);
    }
    if !unmatched.is_empty() {
        println!(
            "{} countries missing from the hierarchy, listed in {:?}",
            unmatched.len(),
            countries_path
        );
    }
    println!("Output:   {:?}", settings.output_path);
    println!("Failures: {:?}", settings.failures_path);
    Ok(())
}

fn regions_summary(settings: &Settings) -> anyhow::Result<()> {
    let table = load_regions(settings)?;

    println!(
        "{:<36} | {:>7} | {:>12} | {:>12}",
        "Region", "Members", "Reported (M)", "Members (M)"
    );
    println!("{}", "-".repeat(76));
    for region in table.regions() {
        println!(
            "{:<36} | {:>7} | {:>12.1} | {:>12.1}",
            truncate(&region.name, 36),
            region.countries.len(),
            region.reported_population,
            region.member_population()
        );
    }

    if !table.duplicates().is_empty() {
        println!("\n--- Countries under more than one region (last one wins) ---");
        for dup in table.duplicates() {
            println!(
                "  {}: {} -> {}",
                dup.country, dup.shadowed_region, dup.winning_region
            );
        }
    }

    println!(
        "\n{} regions | {} countries",
        table.regions().len(),
        table.country_count()
    );
    Ok(())
}

fn checkpoint_stats(settings: &Settings) -> anyhow::Result<()> {
    if !settings.checkpoint_path.exists() {
        println!("No checkpoint at {:?}.", settings.checkpoint_path);
        return Ok(());
    }
    let cp = Checkpoint::open(&settings.checkpoint_path)?;
    let s = cp.stats()?;
    println!("Revisions: {}", s.revisions);
    println!("Qualities: {}", s.qualities);
    match &s.latest_run {
        Some(run_id) if s.failures_by_stage.is_empty() => {
            println!("Latest run: {} (no failures)", run_id);
        }
        Some(run_id) => {
            println!("Latest run: {}", run_id);
            for (stage, count) in &s.failures_by_stage {
                println!("  {:<14} {}", stage, count);
            }
        }
        None => println!("No runs recorded."),
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    Ok(())
}

/// `wp_failures.csv` → `wp_failures_countries.txt`
fn unmatched_countries_path(failures_path: &Path) -> PathBuf {
    let stem = failures_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "failures".to_string());
    failures_path.with_file_name(format!("{}_countries.txt", stem))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

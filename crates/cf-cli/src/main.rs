//! Content filter CLI
//!
//! CLI tool for compiling filter lists, building rule indices and reading
//! blocking statistics.

mod source;

use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};

use cf_core::{ActivationType, Decision, MatchOptions, Request, ResourceType, RuleSource, RulesIndex};
use cf_engine::{StatsData, StatsStore};

use source::{compile_source_bytes, load_sources, parse_group, read_bytes, write_bytes};

#[derive(Parser)]
#[command(name = "cf-cli")]
#[command(about = "Content filter list compiler and tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a filter list into a rule source
    Compile {
        /// Input filter list file
        #[arg(short, long)]
        input: String,

        /// Output rule source file
        #[arg(short, long, default_value = "rules.cfrs")]
        output: String,
    },

    /// Validate a rule source
    Validate {
        /// Rule source file to validate
        #[arg(short, long)]
        input: String,
    },

    /// Dump rule source info
    Info {
        /// Rule source file to inspect
        #[arg(short, long)]
        input: String,
    },

    /// Build and persist the rules index of one group
    Index {
        /// Rule group: tracking or ad-blocking
        #[arg(short, long)]
        group: String,

        /// Rule sources or filter lists, in id order
        #[arg(short, long, required = true)]
        input: Vec<String>,

        /// Output index file
        #[arg(short, long, default_value = "rules.cfix")]
        output: String,
    },

    /// Evaluate one request against a set of sources
    Check {
        /// Rule group: tracking or ad-blocking
        #[arg(short, long, default_value = "ad-blocking")]
        group: String,

        /// Rule sources or filter lists, in id order
        #[arg(short, long, required = true)]
        input: Vec<String>,

        /// Request URL
        #[arg(short, long)]
        url: String,

        /// Origin of the requesting document
        #[arg(long)]
        origin: Option<String>,

        /// Resource type, e.g. script, image, main_frame
        #[arg(short = 't', long = "type", default_value = "other")]
        resource_type: String,
    },

    /// Show blocking statistics
    Stats {
        /// Stats database
        #[arg(short, long)]
        db: String,

        /// Only the last N days
        #[arg(long)]
        days: Option<u64>,

        /// Import a legacy counters file first
        #[arg(long)]
        migrate: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile { input, output } => cmd_compile(&input, &output),
        Commands::Validate { input } => cmd_validate(&input),
        Commands::Info { input } => cmd_info(&input),
        Commands::Index { group, input, output } => cmd_index(&group, &input, &output),
        Commands::Check {
            group,
            input,
            url,
            origin,
            resource_type,
        } => cmd_check(&group, &input, &url, origin.as_deref(), &resource_type),
        Commands::Stats {
            db,
            days,
            migrate,
            json,
        } => cmd_stats(&db, days, migrate.as_deref(), json),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn cmd_compile(input: &str, output: &str) -> Result<(), String> {
    let (bytes, report) = compile_source_bytes(Path::new(input))?;
    write_bytes(Path::new(output), &bytes)?;

    println!("Compiled '{}' to '{}'", input, output);
    println!("  Lines:    {}", report.lines);
    println!(
        "  Rules:    {} -> {} (dedupe removed {}, badfilter removed {})",
        report.rules_before, report.rules_after, report.rules_deduped, report.badfiltered_rules
    );
    println!("  Skipped:  {} unsupported", report.unsupported);
    println!("  Size:     {} bytes ({:.1} KB)", bytes.len(), bytes.len() as f64 / 1024.0);
    println!("  Time:     {:.1}ms", report.total_ms);

    Ok(())
}

fn cmd_validate(input: &str) -> Result<(), String> {
    let bytes = read_bytes(Path::new(input))?;

    let source = RuleSource::load(&bytes)
        .map_err(|e| format!("Invalid rule source: {}", e))?;

    println!("Rule source '{}' is valid", input);
    println!("  Rules:       {}", source.len());
    println!("  Checksum:    {}", source.checksum());
    println!("  Size:        {} bytes", bytes.len());

    Ok(())
}

fn cmd_info(input: &str) -> Result<(), String> {
    let bytes = read_bytes(Path::new(input))?;

    let source = RuleSource::load(&bytes)
        .map_err(|e| format!("Invalid rule source: {}", e))?;
    let meta = source.metadata();

    println!("Rule source: {}", input);
    println!("  Magic:       CFRS");
    println!("  Version:     {}", cf_core::RULES_FORMAT_VERSION);
    println!("  Checksum:    {}", source.checksum());
    println!("  Total size:  {} bytes ({:.1} KB)", bytes.len(), bytes.len() as f64 / 1024.0);
    println!();

    println!("Metadata:");
    println!("  Title:       {}", meta.title);
    println!("  Homepage:    {}", meta.homepage);
    println!("  License:     {}", meta.license);
    println!("  Version:     {}", meta.version);
    match meta.expires_hours {
        Some(hours) => println!("  Expires:     {} hours", hours),
        None => println!("  Expires:     -"),
    }
    println!();

    let rules = source.rules();
    let count = |decision: Decision| rules.iter().filter(|r| r.decision == decision).count();
    println!("Rules:");
    println!("  Count:       {}", rules.len());
    println!("  Block:       {}", count(Decision::Modify));
    println!("  Important:   {}", count(Decision::ModifyImportant));
    println!("  Allow:       {}", count(Decision::Pass));
    println!("  Document:    {}", rules.iter().filter(|r| r.is_activation()).count());

    Ok(())
}

fn cmd_index(group: &str, inputs: &[String], output: &str) -> Result<(), String> {
    let group = parse_group(group)?;
    let sources = load_sources(inputs)?;

    let start = Instant::now();
    let index = RulesIndex::build(group, sources.clone());
    let build_time = start.elapsed();

    let bytes = index.serialize();
    RulesIndex::load(&bytes, group, sources)
        .map_err(|e| format!("Persisted index failed validation: {}", e))?;
    write_bytes(Path::new(output), &bytes)?;

    println!("Indexed {} sources for '{}' to '{}'", inputs.len(), group, output);
    println!("  Rules:    {}", index.len());
    println!("  Checksum: {}", index.checksum());
    println!("  Size:     {} bytes ({:.1} KB)", bytes.len(), bytes.len() as f64 / 1024.0);
    println!("  Time:     {:.1}ms", build_time.as_secs_f64() * 1000.0);

    Ok(())
}

fn cmd_check(
    group: &str,
    inputs: &[String],
    url: &str,
    origin: Option<&str>,
    resource_type: &str,
) -> Result<(), String> {
    let group = parse_group(group)?;
    let index = RulesIndex::build(group, load_sources(inputs)?);

    let activations = origin.map(|origin| index.activations_for_frame(origin, Some(origin), None));
    if let Some(activations) = &activations {
        for (activation_type, result) in activations.iter() {
            if let Some(rule) = &result.rule {
                println!(
                    "Activation:  {} {:?} by '{}'",
                    activation_type.name(),
                    rule.rule().decision,
                    rule.rule().original_rule_text
                );
            }
        }
        if activations.is_document_exempt() {
            println!("Decision:    Pass (document exempt)");
            return Ok(());
        }
    }

    let options = MatchOptions {
        disable_generic_rules: activations
            .as_ref()
            .is_some_and(|a| a.is_pass(ActivationType::GENERIC_BLOCK)),
        ad_attribution: None,
    };
    let request = Request::new(url, origin, ResourceType::from_name(resource_type));
    let verdict = index.evaluate_with(&request, options);

    let outcome = if verdict.is_blocked() { "blocked" } else { "allowed" };
    println!("Decision:    {:?} ({})", verdict.decision, outcome);
    match &verdict.rule {
        Some(rule) => {
            println!("Rule:        {}", rule.rule().original_rule_text);
            println!("Source:      [{}] {}", rule.source_id(), rule.source_title());
        }
        None => println!("Rule:        -"),
    }

    Ok(())
}

fn cmd_stats(db: &str, days: Option<u64>, migrate: Option<&str>, json: bool) -> Result<(), String> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start runtime: {}", e))?;
    let store = StatsStore::open(db).map_err(|e| format!("Failed to open '{}': {}", db, e))?;

    let end = SystemTime::now();
    let begin = days
        .and_then(|d| end.checked_sub(Duration::from_secs(d * 24 * 60 * 60)))
        .unwrap_or(UNIX_EPOCH);

    let stats = runtime.block_on(async {
        if let Some(legacy) = migrate {
            match store.migrate_legacy(Path::new(legacy)).await {
                Ok(true) => log::info!("imported legacy counters from '{}'", legacy),
                Ok(false) => log::info!("nothing to import from '{}'", legacy),
                Err(e) => return Err(format!("Failed to migrate '{}': {}", legacy, e)),
            }
        }
        Ok(store.get_stats(begin, end).await)
    })?;

    if json {
        let text = serde_json::to_string_pretty(&stats)
            .map_err(|e| format!("Failed to encode stats: {}", e))?;
        println!("{text}");
    } else {
        print_stats(&stats);
    }

    Ok(())
}

fn print_stats(stats: &StatsData) {
    if let Some(start) = stats.reporting_start.and_then(|t| t.duration_since(UNIX_EPOCH).ok()) {
        println!("Reporting since {} (unix seconds)", start.as_secs());
    }
    println!("  Ads blocked:      {}", stats.total_ads_blocked());
    println!("  Trackers blocked: {}", stats.total_trackers_blocked());
    println!();

    println!("Trackers and ads:");
    for entry in &stats.trackers {
        println!("  {:<40} {:>6} ads {:>6} trackers", entry.host, entry.ad_count, entry.tracker_count);
    }
    println!();

    println!("Websites:");
    for entry in &stats.websites {
        println!("  {:<40} {:>6} ads {:>6} trackers", entry.host, entry.ad_count, entry.tracker_count);
    }
}

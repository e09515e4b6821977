//! Command-line front end for reuse-distance profile analysis.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rda_profile::attribution::{
    access_share_overlap, miss_contributors, top_miss_overlap, weight_matched_accuracy,
    MappedProfile, RankingOptions,
};
use rda_profile::config::AnalysisConfig;
use rda_profile::core::{Distance, DistanceKey};
use rda_profile::curve::DistanceRange;
use rda_profile::datafile::{is_rddata_file, DataFile};
use rda_profile::differential::DifferentialProfile;
use rda_profile::histogram::{ReferenceKind, ReuseProfile};
use rda_profile::metrics::{miss_ratio_table, ProfileMetrics};
use rda_profile::miss_profile::MissProfile;
use rda_profile::predictions::{overall_hit_ratio, prediction_sizes};
use rda_profile::skid::{InstructionListing, SkidCorrector};
use rda_profile::source_cache::{source_profile, Addr2Line, SourceLineCache};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rda-profile", version, about = "Reuse-distance profile analysis")]
struct Cli {
    /// Analysis configuration (TOML); defaults apply to anything it leaves out
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Predicted miss ratios at the configured cache sizes
    Ratios(StackArgs),
    /// Distance and sample summary of each data file
    Metrics(StackArgs),
    /// Hit ratios of the profiler's interval predictions
    Predictions(StackArgs),
    /// PCs ranked by misses at one cache size
    Pcs(PcArgs),
    /// Compare the PC miss rankings and curves of two data files
    Compare(CompareArgs),
    /// Build a differential profile from two runs and save it
    Diff(DiffArgs),
    /// Apply a saved differential profile to a run
    Adjust(AdjustArgs),
    /// Attribute accesses to source lines
    Source(SourceArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    All,
    Read,
    Write,
    Fetch,
    Prefetch,
}

impl From<KindArg> for ReferenceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::All => ReferenceKind::All,
            KindArg::Read => ReferenceKind::Read,
            KindArg::Write => ReferenceKind::Write,
            KindArg::Fetch => ReferenceKind::Fetch,
            KindArg::Prefetch => ReferenceKind::Prefetch,
        }
    }
}

#[derive(Args)]
struct StackArgs {
    /// Reuse-distance data files
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// Stack to read from each file
    #[arg(long, default_value = "simStacks")]
    stack: String,
    /// Reference kind to analyze
    #[arg(long, value_enum, default_value_t = KindArg::All)]
    kind: KindArg,
}

#[derive(Args)]
struct PcArgs {
    file: PathBuf,
    /// PC record table to rank
    #[arg(long, default_value = "PCDist")]
    pcs: String,
    /// Cache size in bytes (defaults to the configured PC cache size)
    #[arg(long)]
    size: Option<u64>,
    /// Number of PCs to print
    #[arg(long, default_value_t = 20)]
    count: usize,
    /// Print miss shares instead of counts
    #[arg(long)]
    fraction: bool,
}

#[derive(Args)]
struct CompareArgs {
    baseline: PathBuf,
    candidate: PathBuf,
    #[arg(long, default_value = "PCDist")]
    pcs: String,
    #[arg(long, default_value = "simStacks")]
    stack: String,
}

/// A run is either a reuse-distance data file or a sampler file. Sampler files need the
/// disassembly listing; instruction samples are read from `<file>.insts` when present.
#[derive(Args)]
struct RunArgs {
    /// Disassembly listing (objdump -d) of the profiled binary
    #[arg(long)]
    listing: Option<PathBuf>,
    #[arg(long, default_value = "PCDist")]
    pcs: String,
}

#[derive(Args)]
struct DiffArgs {
    first: PathBuf,
    second: PathBuf,
    /// Where to save the differential profile
    #[arg(long, short)]
    output: PathBuf,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct AdjustArgs {
    /// Saved differential profile
    diff: PathBuf,
    target: PathBuf,
    /// Scale deltas by sample period and instruction counts instead of relative reductions
    #[arg(long)]
    scaled: bool,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct SourceArgs {
    file: PathBuf,
    /// Profiled binary, passed to addr2line
    #[arg(long)]
    binary: PathBuf,
    /// Source-line cache file (defaults to `<binary name>.index`)
    #[arg(long)]
    cache: Option<PathBuf>,
    #[arg(long, default_value = "PCDist")]
    pcs: String,
    /// Also print each source file with per-line access counts
    #[arg(long)]
    annotate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = match &cli.config {
        Some(path) => AnalysisConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AnalysisConfig::default(),
    };
    match cli.command {
        Command::Ratios(args) => run_ratios(&config, &args),
        Command::Metrics(args) => run_metrics(&args),
        Command::Predictions(args) => run_predictions(&args),
        Command::Pcs(args) => run_pcs(&config, &args),
        Command::Compare(args) => run_compare(&config, &args),
        Command::Diff(args) => run_diff(&config, &args),
        Command::Adjust(args) => run_adjust(&config, &args),
        Command::Source(args) => run_source(&args),
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_data(path: &Path) -> Result<DataFile> {
    DataFile::load(path).with_context(|| format!("reading data file {}", path.display()))
}

fn load_stack(path: &Path, stack: &str) -> Result<ReuseProfile> {
    load_data(path)?
        .reuse_profile(stack)
        .with_context(|| format!("resolving {stack} in {}", path.display()))
}

fn run_ratios(config: &AnalysisConfig, args: &StackArgs) -> Result<()> {
    for path in &args.files {
        let profile = load_stack(path, &args.stack)?;
        let Some(store) = profile.store(args.kind.into()) else {
            warn!(path = %path.display(), "no histogram for this reference kind");
            continue;
        };
        println!("---- {} ----", path.display());
        for row in miss_ratio_table(store, &config.cache_sizes_bytes, config.block_bytes)? {
            println!(
                "{:>10} B {:>10} lines  miss {:>7.3}%  predicted misses {:.0}",
                row.size_bytes, row.capacity, row.miss_ratio_percent, row.predicted_misses
            );
        }
        println!(
            "{:.0}% of accesses within distance {}",
            config.distance_fraction * 100.0,
            store.quantile(config.distance_fraction)?
        );
    }
    Ok(())
}

fn run_metrics(args: &StackArgs) -> Result<()> {
    for path in &args.files {
        let profile = load_stack(path, &args.stack)?;
        let Some(store) = profile.store(args.kind.into()) else {
            warn!(path = %path.display(), "no histogram for this reference kind");
            continue;
        };
        let m = ProfileMetrics::from_store(store)?;
        println!("---- {} ----", path.display());
        println!("total samples {}", m.total_samples);
        println!("histogram avgDist {:.3}", m.histogram_avg_distance);
        if let Some(avg) = m.avg_distance {
            println!("avgDist {avg:.3}");
        }
        if let Some(median) = m.median_distance {
            println!("medianDist {median:.3}");
        }
        println!("cold+coherence fraction {:.3}%", m.cold_coherence_fraction * 100.0);
        println!("bottom frac {:.3}%", m.bottom_fraction * 100.0);
    }
    Ok(())
}

fn run_predictions(args: &StackArgs) -> Result<()> {
    for path in &args.files {
        let profile = load_stack(path, &args.stack)?;
        let store = profile.all();
        let selection = store.default_selection();
        println!("---- {} ----", path.display());
        for size in prediction_sizes(profile.predictions()) {
            let ratio = overall_hit_ratio(store, profile.predictions(), size, &selection)?;
            println!("{size:>10} {:.4}", ratio);
        }
    }
    Ok(())
}

fn run_pcs(config: &AnalysisConfig, args: &PcArgs) -> Result<()> {
    let data = load_data(&args.file)?;
    let pcs = data.pc_profile(&args.pcs)?;
    let map = data.library_map()?;
    let capacity = config.cache_lines(args.size.unwrap_or(config.pc_cache_size_bytes));
    let options = RankingOptions {
        include_sentinels: config.include_sentinels,
        slice: Some(args.count),
        as_fraction: args.fraction,
    };
    for (pc, misses) in miss_contributors(&pcs, capacity, &options) {
        println!("{:>24} {misses}", map.normalize(pc).to_string());
    }
    Ok(())
}

/// Capacity at which PC rankings are compared: the configured quantile of the baseline curve.
fn comparison_capacity(config: &AnalysisConfig, baseline: &ReuseProfile) -> Distance {
    match baseline.all().quantile(config.distance_fraction) {
        Ok(DistanceKey::Finite(d)) => d,
        Ok(_) | Err(_) => config.cache_lines(config.pc_cache_size_bytes),
    }
}

fn run_compare(config: &AnalysisConfig, args: &CompareArgs) -> Result<()> {
    let base_data = load_data(&args.baseline)?;
    let cand_data = load_data(&args.candidate)?;
    let base_pcs = base_data.pc_profile(&args.pcs)?;
    let cand_pcs = cand_data.pc_profile(&args.pcs)?;
    let base_map = base_data.library_map()?;
    let cand_map = cand_data.library_map()?;
    let base = MappedProfile::new(&base_pcs, &base_map);
    let cand = MappedProfile::new(&cand_pcs, &cand_map);

    let base_stack = base_data.reuse_profile(&args.stack)?;
    let cand_stack = cand_data.reuse_profile(&args.stack)?;
    let capacity = comparison_capacity(config, &base_stack);
    info!(%capacity, "comparing PC rankings");

    for &coverage in &config.coverage_fractions {
        let wm = weight_matched_accuracy(base, cand, capacity, coverage, config.include_sentinels)?;
        let shares = access_share_overlap(base, cand, coverage)?;
        println!(
            "coverage {:.2}: top {} PCs, weight-matched {:.2}%, access-share {:.2}% ({} common)",
            coverage, wm.prefix_len, wm.accuracy_percent, shares.accuracy_percent, shares.common
        );
    }

    let capacities: Vec<Distance> = config
        .cache_sizes_bytes
        .iter()
        .map(|b| config.cache_lines(*b))
        .collect();
    let overlap = top_miss_overlap(
        &[base, cand],
        &capacities,
        config.top_compare_count,
        config.include_sentinels,
    );
    if let Some(common) = overlap.overlap {
        for (capacity, n) in capacities.iter().zip(common) {
            println!("top {} at {} lines: {} shared", config.top_compare_count, capacity, n);
        }
    }

    let diff = base_stack
        .all()
        .histogram_difference(cand_stack.all(), &DistanceRange::full())?;
    println!("histogram accuracy {:.2}%", diff.accuracy_percent);
    Ok(())
}

fn corrector(config: &AnalysisConfig, listing: Option<&Path>) -> Result<Option<SkidCorrector>> {
    let Some(path) = listing else {
        return Ok(None);
    };
    let listing = InstructionListing::load(path)
        .with_context(|| format!("reading listing {}", path.display()))?;
    let corrector = SkidCorrector::new(listing)
        .with_skid(config.skid_instructions)
        .function_relative(true);
    info!(
        skid = corrector.skid(),
        instructions = corrector.listing().len(),
        "skid correction enabled"
    );
    Ok(Some(corrector))
}

fn load_run(
    config: &AnalysisConfig,
    path: &Path,
    run: &RunArgs,
    corrector: Option<&SkidCorrector>,
) -> Result<MissProfile> {
    let name = path.display().to_string();
    if is_rddata_file(path)? {
        let pcs = load_data(path)?.pc_profile(&run.pcs)?;
        let capacity = config.cache_lines(config.pc_cache_size_bytes);
        return Ok(MissProfile::from_pc_profile(name, &pcs, capacity, corrector));
    }
    let Some(corrector) = corrector else {
        bail!("{} is a sample file and needs --listing", path.display());
    };
    let mut insts = path.as_os_str().to_owned();
    insts.push(".insts");
    MissProfile::load_samples(name, path, Some(Path::new(&insts)), corrector)
        .with_context(|| format!("reading samples {}", path.display()))
}

fn run_diff(config: &AnalysisConfig, args: &DiffArgs) -> Result<()> {
    let corrector = corrector(config, args.run.listing.as_deref())?;
    let first = load_run(config, &args.first, &args.run, corrector.as_ref())?;
    let second = load_run(config, &args.second, &args.run, corrector.as_ref())?;
    let diff = DifferentialProfile::new(&first, &second)?;
    diff.save(&args.output)
        .with_context(|| format!("saving {}", args.output.display()))?;
    println!(
        "{} PCs, total relative change {:.4}",
        diff.len(),
        diff.total_relative_change()?
    );
    Ok(())
}

fn run_adjust(config: &AnalysisConfig, args: &AdjustArgs) -> Result<()> {
    let diff = DifferentialProfile::load(&args.diff)
        .with_context(|| format!("loading {}", args.diff.display()))?;
    let corrector = corrector(config, args.run.listing.as_deref())?;
    let mut target = load_run(config, &args.target, &args.run, corrector.as_ref())?;
    let before = target.total_misses();
    let adjusted = if args.scaled {
        diff.adjust_scaled(&mut target)
    } else {
        diff.adjust_relative(&mut target)
    };
    let after = target.total_misses();
    println!("adjusted {adjusted} PCs: misses {before:.0} -> {after:.0}");
    if before > 0.0 {
        println!("change {:.2}%", (before - after) / before * 100.0);
    }
    Ok(())
}

fn run_source(args: &SourceArgs) -> Result<()> {
    let data = load_data(&args.file)?;
    let pcs = data.pc_profile(&args.pcs)?;
    let map = data.library_map()?;
    let cache_path = match &args.cache {
        Some(path) => path.clone(),
        None => {
            let stem = args
                .binary
                .file_name()
                .context("binary path has no file name")?;
            let mut name = stem.to_owned();
            name.push(".index");
            PathBuf::from(name)
        }
    };
    let mut cache = SourceLineCache::load(&cache_path)?;
    let symbolizer = Addr2Line::new(&args.binary);
    let profile = source_profile(&pcs, &mut cache, &symbolizer, &map)?;
    cache.flush()?;

    for (file, count) in profile.files_by_count() {
        println!("{:.4}: {file} ({count})", profile.file_fraction(file));
    }
    if args.annotate {
        for (file, _) in profile.files_by_count() {
            let handle = match std::fs::File::open(file) {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(file, %err, "unable to open source file");
                    continue;
                }
            };
            println!("==== {file} ====");
            for (count, text) in profile.annotate(file, std::io::BufReader::new(handle))? {
                println!("{count:>8} {text}");
            }
        }
    }
    Ok(())
}

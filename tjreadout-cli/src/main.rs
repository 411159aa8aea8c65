//! TJ readout CLI application.
//!
//! Decodes persisted raw word files, builds triggered events, and replays raw
//! files through the continuous readout engine.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tjreadout_core::decoder::{read_index_table, read_raw_words};
use tjreadout_core::readout::{CallbackResult, DataCallback, ErrorCallback};
use tjreadout_core::types::TaggedRecord;
use tjreadout_core::{
    output, Config, EventBuilder, HitRecord, RawWordDecoder, ReadoutChunk, ReadoutEngine,
    ReadoutError, Record, ReplayFifo, StreamCorrelator, TimestampEvent, TriggerRecord,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Readout and decoding tool for TJ pixel detector raw data.
#[derive(Parser, Debug)]
#[command(name = "tjreadout")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML configuration file; every section falls back to defaults
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a raw file into hits and triggers
    Decode(DecodeArgs),
    /// Decode, correlate triggers and assign hits to events
    Build(BuildArgs),
    /// Replay a raw file through the readout engine
    Replay(ReplayArgs),
    /// Write the default configuration as YAML
    InitConfig {
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct DecodeArgs {
    /// Input raw file of little-endian 32-bit words
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output file path (.csv, .bin)
    ///
    /// The output format is determined by the file extension:
    /// - .csv: Comma-separated values (human-readable)
    /// - .bin: Binary format (efficient, for programmatic access)
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Output file for widened triggers (optional)
    #[arg(short, long, value_name = "PATH")]
    triggers: Option<PathBuf>,

    /// Meta-index CSV; reports hits per scan parameter
    #[arg(short, long, value_name = "PATH")]
    index: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Input raw file of little-endian 32-bit words
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output CSV of hits assigned to events
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Output file for correlated triggers (optional)
    #[arg(short, long, value_name = "PATH")]
    triggers: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// Input raw file of little-endian 32-bit words
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Words handed out per FIFO drain
    #[arg(long, default_value_t = 4096)]
    chunk_size: usize,

    /// Give up waiting for the replay after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Write hits decoded online to this CSV file
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn progress_bar(quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::read_config_file(path)
            .with_context(|| format!("Failed to load configuration {:?}", path)),
        None => Ok(Config::default()),
    }
}

fn file_name(path: &Path) -> &std::ffi::OsStr {
    path.file_name().unwrap_or_default()
}

/// Records of one decode pass split by kind.
#[derive(Default)]
struct Decoded {
    hits: Vec<HitRecord>,
    triggers: Vec<TriggerRecord>,
    timestamps: Vec<TimestampEvent>,
}

impl Decoded {
    fn collect<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut out = Self::default();
        for record in records {
            match record {
                Record::Hit(hit) => out.hits.push(*hit),
                Record::Trigger(trigger) => out.triggers.push(*trigger),
                Record::Timestamp(ts) => out.timestamps.push(*ts),
                Record::Diagnostic(_) => {}
            }
        }
        out
    }
}

fn write_hits(path: &Path, hits: &[HitRecord]) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("csv")
        .to_lowercase();
    match ext.as_str() {
        "csv" => output::write_hits_csv(path, hits).context("Failed to write CSV output"),
        "bin" => output::write_binary(path, hits).context("Failed to write binary output"),
        _ => anyhow::bail!("Unsupported output format: .{}. Use .csv or .bin", ext),
    }
}

fn run_decode(args: &DecodeArgs, config: &Config, quiet: bool) -> Result<()> {
    let progress = progress_bar(quiet)?;
    let start_time = Instant::now();
    progress.set_message(format!("Decoding {:?}...", file_name(&args.input)));

    let mut decoder = RawWordDecoder::with_config(config.decoder);
    let decoded = match &args.index {
        Some(index_path) => {
            let table = read_index_table(index_path)
                .with_context(|| format!("Failed to read index table {:?}", index_path))?;
            let words = read_raw_words(&args.input)
                .context("Failed to read raw file")?;
            let tagged = decoder
                .decode_tagged(&words, &table)
                .context("Failed to decode raw file")?;
            report_scan_params(&tagged);
            Decoded::collect(tagged.iter().map(|t| &t.record))
        }
        None => {
            let records = decoder
                .decode_file(&args.input)
                .context("Failed to decode raw file")?;
            Decoded::collect(&records)
        }
    };
    let counts = decoder.error_counts();

    progress.set_message(format!("Writing to {:?}...", file_name(&args.output)));
    write_hits(&args.output, &decoded.hits)?;

    if let Some(trigger_path) = &args.triggers {
        output::write_trigger_csv(trigger_path, &decoded.triggers)
            .context("Failed to write trigger CSV")?;
    }

    let total_duration = start_time.elapsed();
    progress.finish_with_message(format!(
        "Done! Decoded {} hits, {} triggers in {:.2}s",
        decoded.hits.len(),
        decoded.triggers.len(),
        total_duration.as_secs_f64()
    ));

    if !quiet {
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:          {:?}", args.input);
        eprintln!("  Output:         {:?}", args.output);
        eprintln!("  Hits:           {}", decoded.hits.len());
        eprintln!("  Triggers:       {}", decoded.triggers.len());
        eprintln!("  Framing errors: {}", counts.framing);
        eprintln!("  Trash words:    {}", counts.trash);
        eprintln!("  Duration:       {:.3}s", total_duration.as_secs_f64());
    }
    Ok(())
}

fn report_scan_params(tagged: &[TaggedRecord]) {
    let mut per_param = std::collections::BTreeMap::new();
    for record in tagged {
        if let Record::Hit(_) = record.record {
            *per_param.entry(record.scan_param_id).or_insert(0u64) += 1;
        }
    }
    for (scan_param_id, hits) in per_param {
        info!(?scan_param_id, hits, "Hits per scan parameter");
    }
}

fn run_build(args: &BuildArgs, config: &Config, quiet: bool) -> Result<()> {
    let progress = progress_bar(quiet)?;
    let start_time = Instant::now();
    progress.set_message(format!("Decoding {:?}...", file_name(&args.input)));

    // Correlation needs the trigger domain's timestamp triples
    let mut decoder_config = config.decoder;
    decoder_config.emit_timestamp_events = true;
    let mut decoder = RawWordDecoder::with_config(decoder_config);
    let records = decoder
        .decode_file(&args.input)
        .context("Failed to decode raw file")?;
    let mut decoded = Decoded::collect(&records);
    decoded
        .timestamps
        .retain(|ts| ts.domain == decoder_config.trigger_domain);

    progress.set_message("Correlating triggers...");
    let correlator = StreamCorrelator::new(config.correlator).context("Invalid correlator")?;
    let (triggers, correlation) = correlator
        .correlate_triggers(&decoded.triggers, &decoded.timestamps)
        .context("Failed to correlate trigger and timestamp streams")?;
    if let Some(extra) = correlation.extra {
        warn!(?extra, "Leading records skipped to synchronize");
    }

    progress.set_message("Building events...");
    let builder = EventBuilder::new(config.builder).context("Invalid builder window")?;
    let built = builder.build_marked(&triggers, &decoded.hits);

    output::write_events_csv(&args.output, &built.hits).context("Failed to write event CSV")?;
    if let Some(trigger_path) = &args.triggers {
        let file = std::fs::File::create(trigger_path)
            .with_context(|| format!("Failed to create {:?}", trigger_path))?;
        let mut writer = output::TriggerCsvWriter::new(file);
        writer
            .write_correlated(&triggers)
            .context("Failed to write correlated trigger CSV")?;
        writer.flush()?;
    }

    let total_duration = start_time.elapsed();
    progress.finish_with_message(format!(
        "Done! Built {} events from {} hits in {:.2}s",
        built.events,
        built.hits.len(),
        total_duration.as_secs_f64()
    ));

    if !quiet {
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:              {:?}", args.input);
        eprintln!("  Output:             {:?}", args.output);
        eprintln!("  Triggers:           {}", triggers.len());
        eprintln!("  Unmatched triggers: {}", correlation.unmatched_a);
        eprintln!("  Unmatched stamps:   {}", correlation.unmatched_b);
        eprintln!("  Events:             {}", built.events);
        eprintln!("  Assigned hits:      {}", built.hits.len());
        eprintln!("  Dropped hits:       {}", built.dropped);
    }
    Ok(())
}

fn run_replay(args: &ReplayArgs, config: &Config, quiet: bool) -> Result<()> {
    let fifo = ReplayFifo::from_file(&args.input, args.chunk_size)
        .with_context(|| format!("Failed to load {:?}", args.input))?;
    let total_words = fifo.len() as u64;

    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(total_words);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} words {msg}")?,
        );
        pb
    };

    let received = Arc::new(AtomicU64::new(0));
    let hits: Arc<Mutex<Vec<HitRecord>>> = Arc::default();

    let on_data: DataCallback = {
        let received = Arc::clone(&received);
        let hits = Arc::clone(&hits);
        let progress = progress.clone();
        Box::new(move |chunk: ReadoutChunk| -> CallbackResult {
            let words = chunk.data.len() as u64;
            if let Some(records) = &chunk.records {
                hits.lock().extend(records.iter().filter_map(Record::as_hit).copied());
            }
            received.fetch_add(words, Ordering::AcqRel);
            progress.inc(words);
            Ok(())
        })
    };
    let on_error: ErrorCallback = Arc::new(|e: ReadoutError| warn!(error = %e, "Readout error"));

    let mut options = config.readout.clone();
    if args.output.is_some() && options.online_decoding.is_none() {
        options.online_decoding = Some(config.decoder);
    }

    let mut engine = ReadoutEngine::new(fifo, None);
    engine
        .start(Some(on_data), Some(on_error), options)
        .context("Failed to start readout")?;

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    while received.load(Ordering::Acquire) < total_words && Instant::now() < deadline {
        if let Some(rate) = engine.throughput() {
            progress.set_message(format!("{:.0} words/s", rate));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let outcome = engine
        .stop(Duration::from_secs(5))
        .context("Failed to stop readout")?;

    let words = received.load(Ordering::Acquire);
    progress.finish_with_message(format!("{:?} stop", outcome));
    if words < total_words {
        warn!(words, total_words, "Replay ended before the whole file was read");
    }

    let hits = std::mem::take(&mut *hits.lock());
    if let Some(path) = &args.output {
        output::write_hits_csv(path, &hits).context("Failed to write CSV output")?;
    }

    if !quiet {
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:    {:?}", args.input);
        eprintln!("  Words:    {}/{}", words, total_words);
        eprintln!("  Chunks:   {}", engine.record_count());
        eprintln!("  Hits:     {}", hits.len());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Command::InitConfig { output } = &cli.command {
        Config::default()
            .write_config_file(output)
            .with_context(|| format!("Failed to write configuration {:?}", output))?;
        info!(path = ?output, "Wrote default configuration");
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    match &cli.command {
        Command::Decode(args) => run_decode(args, &config, cli.quiet),
        Command::Build(args) => run_build(args, &config, cli.quiet),
        Command::Replay(args) => run_replay(args, &config, cli.quiet),
        Command::InitConfig { .. } => Ok(()),
    }
}

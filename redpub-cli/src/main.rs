//! CLI host for the redpub buffered publisher.
//!
//! Provides commands for forwarding JSON records to Redis, inspecting
//! spooled chunk files, and benchmarking the ingest and flush path.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use redpub::{MemoryConnector, PartitionKey, Record, RedisConnector, Sink, SinkConfig};
use tracing_subscriber::EnvFilter;

/// redpub: buffered, chunked event forwarding to Redis pub/sub.
#[derive(Parser)]
#[command(name = "redpub", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Forward JSON-lines records (`{"tag","time","record"}`) to Redis.
    Run {
        /// Path to the JSON configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Input file; reads stdin when omitted.
        #[arg(long)]
        input: Option<PathBuf>,

        /// How many times stalled keys are resumed while the buffer is full
        /// before giving up.
        #[arg(long, default_value = "3")]
        stall_resumes: u32,
    },

    /// Decode a spooled chunk file and print its records.
    Inspect {
        /// Path to a `.chunk` file.
        chunk_file: PathBuf,

        /// Output format.
        #[arg(long, default_value = "summary")]
        format: InspectFormat,
    },

    /// Measure ingest and flush throughput against an in-memory broker.
    Bench {
        /// Number of records to submit.
        #[arg(long, default_value = "200000")]
        records: u64,

        /// Number of distinct tags.
        #[arg(long, default_value = "10")]
        tags: u32,
    },
}

/// Output format for `inspect`.
#[derive(Clone, ValueEnum)]
enum InspectFormat {
    /// Chunk metadata followed by one line per record.
    Summary,
    /// One JSON envelope per line.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            input,
            stall_resumes,
        } => cmd_run(&config, input.as_deref(), stall_resumes),
        Commands::Inspect { chunk_file, format } => cmd_inspect(&chunk_file, &format),
        Commands::Bench { records, tags } => cmd_bench(records, tags),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// What `run` does next while the buffer refuses records.
#[derive(Debug, PartialEq, Eq)]
enum OverflowAction {
    /// Flush and wait for the flush threads to make room.
    Wait,
    /// Give these stalled keys a fresh retry budget, then wait.
    Resume(Vec<PartitionKey>),
    /// Stop reading input; these keys cannot be delivered.
    GiveUp(Vec<PartitionKey>),
}

/// Tracks how often stalled keys were resumed while ingest was blocked.
///
/// With nothing stalled the flush threads are still retrying, so waiting
/// makes progress. Once keys stall, nothing frees buffer space unless they
/// are resumed, and after `max_resumes` rounds the run gives up.
#[derive(Debug)]
struct OverflowGuard {
    max_resumes: u32,
    resumes: u32,
}

impl OverflowGuard {
    fn new(max_resumes: u32) -> Self {
        Self { max_resumes, resumes: 0 }
    }

    fn on_overflow(&mut self, stalled: Vec<PartitionKey>) -> OverflowAction {
        if stalled.is_empty() {
            OverflowAction::Wait
        } else if self.resumes < self.max_resumes {
            self.resumes += 1;
            OverflowAction::Resume(stalled)
        } else {
            OverflowAction::GiveUp(stalled)
        }
    }

    /// A record was accepted, so the buffer is draining again.
    fn on_progress(&mut self) {
        self.resumes = 0;
    }
}

/// Implements `redpub run --config <file> [--input <file>]`.
fn cmd_run(config_path: &Path, input: Option<&Path>, stall_resumes: u32) -> Result<(), Box<dyn std::error::Error>> {
    let config = SinkConfig::from_json_file(config_path)?;
    let retry_interval = config.flush.thread_interval;
    let sink = Sink::start(config.clone(), RedisConnector::from_config(&config))?;

    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(io::stdin().lock()),
    };

    let mut guard = OverflowGuard::new(stall_resumes);
    let mut abandoned: Option<Vec<PartitionKey>> = None;
    let mut submitted = 0u64;
    let mut skipped = 0u64;
    'input: for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record: Record = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("skipping line {}: {e}", index + 1);
                skipped += 1;
                continue;
            }
        };

        loop {
            match sink.submit_record(record.clone()) {
                Ok(()) => {
                    submitted += 1;
                    guard.on_progress();
                    break;
                }
                Err(e) if e.is_overflow() => match guard.on_overflow(sink.stalled()) {
                    OverflowAction::Wait => {
                        tracing::debug!("buffer full, waiting for flush");
                        sink.flush();
                        std::thread::sleep(retry_interval);
                    }
                    OverflowAction::Resume(keys) => {
                        for key in &keys {
                            tracing::warn!(%key, "buffer full behind stalled key, resuming retries");
                            sink.resume(key);
                        }
                        std::thread::sleep(retry_interval);
                    }
                    OverflowAction::GiveUp(keys) => {
                        tracing::error!(
                            line = index + 1,
                            stalled = keys.len(),
                            "buffer full and stalled keys did not recover, stopping input"
                        );
                        abandoned = Some(keys);
                        break 'input;
                    }
                },
                Err(e) => {
                    tracing::warn!("dropping line {}: {e}", index + 1);
                    skipped += 1;
                    break;
                }
            }
        }
    }

    let report = sink.shutdown();

    println!("Submitted: {submitted}");
    println!("Skipped: {skipped}");
    println!("Chunks flushed at shutdown: {}", report.flushed_chunks);
    if report.discarded_chunks > 0 {
        println!("Corrupt chunks discarded: {}", report.discarded_chunks);
    }

    if let Some(keys) = abandoned {
        let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
        return Err(format!(
            "input stopped after {submitted} record(s): buffer full behind stalled key(s) {}",
            keys.join(", ")
        )
        .into());
    }

    if !report.is_clean() {
        for key in &report.stalled_keys {
            eprintln!("  stalled: {key}");
        }
        return Err(format!(
            "{} chunk(s), {} left undelivered",
            report.remaining_chunks,
            format_bytes(report.remaining_bytes)
        )
        .into());
    }

    Ok(())
}

/// Implements `redpub inspect <chunk-file>`.
fn cmd_inspect(path: &Path, format: &InspectFormat) -> Result<(), Box<dyn std::error::Error>> {
    let chunk = redpub::spool::read_chunk_file(path)?;
    let records = redpub::codec::decode_chunk(chunk.data())?;

    match format {
        InspectFormat::Json => {
            for record in &records {
                println!("{}", serde_json::to_string(record)?);
            }
        }
        InspectFormat::Summary => {
            println!("Chunk: {}", path.display());
            println!("  Id: {}", chunk.id());
            println!("  Tag: {}", chunk.key().tag);
            println!("  Bucket: {}", chunk.key().bucket);
            println!("  Size: {}", format_bytes(chunk.len()));
            println!("  Records: {}", records.len());

            if let (Some(min), Some(max)) = (
                records.iter().map(|r| r.time).min(),
                records.iter().map(|r| r.time).max(),
            ) {
                println!("  Time range: {min}..={max}");
            }

            println!();
            for (i, record) in records.iter().enumerate() {
                println!(
                    "  [{i}] {} {} {}",
                    record.time,
                    record.tag,
                    serde_json::Value::Object(record.fields.clone())
                );
            }
        }
    }

    Ok(())
}

/// Implements `redpub bench`.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)] // Benchmark arithmetic is display-only
fn cmd_bench(records: u64, tags: u32) -> Result<(), Box<dyn std::error::Error>> {
    if tags == 0 {
        return Err("--tags must be at least 1".into());
    }

    println!("redpub ingest/flush benchmark");
    println!("  Records: {records}");
    println!("  Tags: {tags}");
    println!();

    let broker = MemoryConnector::new();
    let sink = Sink::start(SinkConfig::default(), broker.clone())?;

    let tag_names: Vec<String> = (0..tags).map(|i| format!("bench.tag{i}")).collect();
    let base_time = 1_700_000_000i64;

    let start = Instant::now();
    let mut i = 0u64;
    while i < records {
        let tag = &tag_names[(i % u64::from(tags)) as usize];
        let mut fields = serde_json::Map::new();
        fields.insert("seq".to_string(), serde_json::Value::from(i));
        fields.insert("message".to_string(), serde_json::Value::from("benchmark payload"));

        match sink.submit(tag.as_str(), base_time + (i / 1000) as i64, fields) {
            Ok(()) => i += 1,
            Err(e) if e.is_overflow() => {
                sink.flush();
                std::thread::yield_now();
            }
            Err(e) => return Err(e.into()),
        }
    }
    let ingest_elapsed = start.elapsed();

    let flush_start = Instant::now();
    let report = sink.shutdown();
    let flush_elapsed = flush_start.elapsed();
    let total_elapsed = start.elapsed();

    let published = broker.messages().len();
    let ns_per_record = ingest_elapsed.as_nanos() as f64 / records.max(1) as f64;
    let records_per_sec = published as f64 / total_elapsed.as_secs_f64();

    println!("Results:");
    println!("  Ingest elapsed: {ingest_elapsed:.3?}");
    println!("  Avg ingest latency: {ns_per_record:.1} ns/record");
    println!("  Drain elapsed: {flush_elapsed:.3?}");
    println!("  Published: {published} messages in {} batches", broker.batches().len());
    println!("  End-to-end throughput: {records_per_sec:.0} records/sec");
    println!("  Clean shutdown: {}", report.is_clean());
    println!();

    Ok(())
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tag: &str) -> PartitionKey {
        PartitionKey::new(tag, 0)
    }

    #[test]
    fn test_overflow_waits_while_nothing_is_stalled() {
        let mut guard = OverflowGuard::new(1);
        for _ in 0..10 {
            assert_eq!(guard.on_overflow(Vec::new()), OverflowAction::Wait);
        }
    }

    #[test]
    fn test_overflow_gives_up_after_resumes_run_out() {
        let mut guard = OverflowGuard::new(2);
        assert_eq!(guard.on_overflow(vec![key("a")]), OverflowAction::Resume(vec![key("a")]));
        assert_eq!(guard.on_overflow(Vec::new()), OverflowAction::Wait);
        assert_eq!(guard.on_overflow(vec![key("a")]), OverflowAction::Resume(vec![key("a")]));
        assert_eq!(guard.on_overflow(vec![key("a")]), OverflowAction::GiveUp(vec![key("a")]));
    }

    #[test]
    fn test_progress_restores_resume_budget() {
        let mut guard = OverflowGuard::new(1);
        assert!(matches!(guard.on_overflow(vec![key("a")]), OverflowAction::Resume(_)));
        guard.on_progress();
        assert!(matches!(guard.on_overflow(vec![key("b")]), OverflowAction::Resume(_)));
        assert!(matches!(guard.on_overflow(vec![key("b")]), OverflowAction::GiveUp(_)));
    }

    #[test]
    fn test_zero_resumes_gives_up_at_first_stall() {
        let mut guard = OverflowGuard::new(0);
        assert_eq!(guard.on_overflow(vec![key("a")]), OverflowAction::GiveUp(vec![key("a")]));
    }
}

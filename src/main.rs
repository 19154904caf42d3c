//! Main entry point for the boundzip CLI application.
//!
//! Lists or extracts a local ZIP archive. Entry content is streamed to disk
//! (or stdout) through memory-checked sinks, so a run never holds more than
//! a few chunks per worker regardless of archive size.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use boundzip::{
    ArchiveEntry, ArchiveReader, ArchiveStreamExtractor, BackpressureHandler, ChunkOptions,
    ChunkedProcessor, Cli, ControlledSink, EntryHandler, Error, ExtractOptions, LocalFileReader,
    ZipArchiveReader,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let reader = Arc::new(
        LocalFileReader::new(&cli.file)
            .with_context(|| format!("cannot open {}", cli.file.display()))?,
    );
    let archive = ZipArchiveReader::new(reader);

    if cli.list || cli.verbose {
        return list_files(&archive, cli.verbose).await;
    }

    extract(&archive, &cli).await
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "boundzip=debug"
    } else if cli.is_very_quiet() {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Print the archive's records, optionally with sizes and compression ratio
async fn list_files(archive: &dyn ArchiveReader, verbose: bool) -> Result<()> {
    let records = archive.records().await?;

    if verbose {
        println!("{:>10}  {:>10}  {:>5}  Name", "Length", "Size", "Cmpr");
        println!("{}", "-".repeat(50));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for record in &records {
        if !verbose {
            println!("{}", record.name);
            continue;
        }

        println!(
            "{:>10}  {:>10}  {}  {}",
            record.uncompressed_size,
            record.compressed_size,
            ratio(record.compressed_size, record.uncompressed_size),
            record.name
        );
        if !record.is_directory {
            total_uncompressed += record.uncompressed_size;
            total_compressed += record.compressed_size;
            file_count += 1;
        }
    }

    if verbose {
        println!("{}", "-".repeat(50));
        println!(
            "{:>10}  {:>10}  {}  {} files",
            total_uncompressed,
            total_compressed,
            ratio(total_compressed, total_uncompressed),
            file_count
        );
    }

    Ok(())
}

fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 {
        format!(
            "{:>4}%",
            100u64.saturating_sub(compressed.saturating_mul(100) / uncompressed)
        )
    } else {
        "  0%".to_string()
    }
}

async fn extract(archive: &dyn ArchiveReader, cli: &Cli) -> Result<()> {
    let config = cli.extract_config()?;
    let chunk_size = config.chunk_size;
    let backpressure_config = config.backpressure.clone();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let options = ExtractOptions::from_config(config)?.with_cancellation(cancel);
    let extractor = ArchiveStreamExtractor::new(options)?;
    let monitor = Arc::clone(extractor.monitor());
    let backpressure = BackpressureHandler::new(Arc::clone(&monitor), backpressure_config);

    let writer = Writer {
        chunker: ChunkedProcessor::new(monitor),
        chunk_size,
        target: if cli.pipe {
            Target::Pipe(Mutex::new(backpressure.wrap_sink(tokio::io::stdout())))
        } else {
            Target::Dir(OutputDir {
                root: cli.extract_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
                junk_paths: cli.junk_paths,
                never_overwrite: cli.never_overwrite,
                overwrite: cli.overwrite,
                quiet: cli.is_quiet(),
                backpressure,
            })
        },
    };

    let report = extractor.extract_with_from(archive, &writer).await?;
    if let Target::Pipe(sink) = &writer.target {
        sink.lock().await.flush().await?;
    }

    if !cli.is_quiet() {
        eprintln!(
            "\n{} extracted, {} skipped, {} in {:.2}s",
            report.entries_processed,
            report.entries_skipped,
            format_size(report.bytes_declared),
            report.elapsed.as_secs_f64()
        );
    }

    Ok(())
}

enum Target {
    Pipe(Mutex<ControlledSink<tokio::io::Stdout>>),
    Dir(OutputDir),
}

struct OutputDir {
    root: PathBuf,
    junk_paths: bool,
    never_overwrite: bool,
    overwrite: bool,
    quiet: bool,
    backpressure: BackpressureHandler,
}

impl OutputDir {
    /// Entry names reaching here have passed the security gate, so joining
    /// them onto the root cannot escape it
    fn output_path(&self, name: &str) -> PathBuf {
        if self.junk_paths {
            let base = Path::new(name)
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| name.to_string());
            self.root.join(base)
        } else {
            self.root.join(name)
        }
    }
}

/// Writes admitted entries to their target in fixed-size chunks
struct Writer {
    chunker: ChunkedProcessor,
    chunk_size: usize,
    target: Target,
}

#[async_trait]
impl EntryHandler for Writer {
    async fn handle(&self, entry: ArchiveEntry) -> boundzip::Result<()> {
        let (record, content) = entry.into_parts();

        match &self.target {
            Target::Pipe(sink) => {
                if record.is_directory {
                    return Ok(());
                }
                let mut chunks =
                    self.chunker
                        .process_stream_in_chunks(content, self.chunk_size, &ChunkOptions::default())?;
                let mut sink = sink.lock().await;
                while let Some(chunk) = chunks.next().await {
                    sink.write(&chunk?).await?;
                }
                Ok(())
            }
            Target::Dir(dir) => {
                if record.is_directory {
                    if !dir.junk_paths {
                        let path = dir.output_path(&record.name);
                        tokio::fs::create_dir_all(&path)
                            .await
                            .map_err(|e| io_failure("creating", &path, e))?;
                    }
                    return Ok(());
                }

                let path = dir.output_path(&record.name);
                if path.exists() {
                    if dir.never_overwrite {
                        if !dir.quiet {
                            eprintln!("Skipping: {} (file exists)", record.name);
                        }
                        return Ok(());
                    }
                    if !dir.overwrite {
                        if !dir.quiet {
                            eprintln!("Skipping: {} (use -o to overwrite)", record.name);
                        }
                        return Ok(());
                    }
                }

                if !dir.quiet {
                    println!("  extracting: {}", record.name);
                }
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_failure("creating", parent, e))?;
                }
                let file = tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| io_failure("creating", &path, e))?;

                let options = ChunkOptions::default().with_total_hint(record.uncompressed_size);
                let mut chunks =
                    self.chunker
                        .process_stream_in_chunks(content, self.chunk_size, &options)?;
                let mut sink = dir.backpressure.wrap_sink(file);
                while let Some(chunk) = chunks.next().await {
                    sink.write(&chunk?).await?;
                }
                sink.shutdown().await?;
                Ok(())
            }
        }
    }
}

fn io_failure(action: &str, path: &Path, source: std::io::Error) -> Error {
    Error::callback(format!("{action} {}", path.display()), source)
}

/// Format a byte size into a human-readable string.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}

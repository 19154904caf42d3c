use clap::Parser;
use std::path::PathBuf;

use crate::config::{ExtractConfig, FilterConfig};
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "boundzip")]
#[command(version)]
#[command(about = "Extract ZIP archives under a fixed memory budget", long_about = None)]
#[command(after_help = "Examples:\n  \
  boundzip data1.zip -x joe                 extract all files except joe from data1.zip\n  \
  boundzip -p foo.zip | more                send contents of foo.zip via pipe into more\n  \
  boundzip big.zip --memory-limit 64 -d out extract into out/ using at most 64 MiB")]
pub struct Cli {
    /// ZIP file path
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Files to extract, as names or glob patterns (default: all)
    #[arg(value_name = "FILES")]
    pub files: Vec<String>,

    /// List files (short format)
    #[arg(short = 'l')]
    pub list: bool,

    /// List verbosely; also raises log output to debug
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Extract files to pipe, no messages
    #[arg(short = 'p')]
    pub pipe: bool,

    /// Extract files into exdir
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<PathBuf>,

    /// Exclude files that follow
    #[arg(short = 'x', value_name = "PATTERN", num_args = 1..)]
    pub exclude: Vec<String>,

    /// Never overwrite existing files
    #[arg(short = 'n')]
    pub never_overwrite: bool,

    /// Overwrite files WITHOUT prompting
    #[arg(short = 'o')]
    pub overwrite: bool,

    /// Junk paths (do not make directories)
    #[arg(short = 'j')]
    pub junk_paths: bool,

    /// Process memory limit in MiB (default: unbounded)
    #[arg(long, value_name = "MB")]
    pub memory_limit: Option<u64>,

    /// Chunk size used when writing entry content
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<usize>,

    /// Entries extracted concurrently
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// JSON configuration file; flags override its values
    #[arg(long, value_name = "JSON")]
    pub config: Option<PathBuf>,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || self.pipe
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    /// Load `--config` if given and apply the command-line overrides
    pub fn extract_config(&self) -> Result<ExtractConfig> {
        let mut config = match &self.config {
            Some(path) => ExtractConfig::from_json_file(path)?,
            None => ExtractConfig::default(),
        };

        if let Some(mb) = self.memory_limit {
            config.memory.limit_bytes = Some(mb.saturating_mul(1024 * 1024));
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        // stdout is a single ordered sink
        if self.pipe {
            config.workers = 1;
        }

        let filter = config.filter.get_or_insert_with(FilterConfig::default);
        filter.include.extend(self.files.iter().cloned());
        filter.exclude.extend(self.exclude.iter().cloned());

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "boundzip",
            "data.zip",
            "*.txt",
            "--memory-limit",
            "64",
            "--workers",
            "3",
            "-x",
            "secret/**",
        ]);
        let config = cli.extract_config().unwrap();
        assert_eq!(config.memory.limit_bytes, Some(64 * 1024 * 1024));
        assert_eq!(config.workers, 3);
        let filter = config.filter.unwrap();
        assert_eq!(filter.include, ["*.txt"]);
        assert_eq!(filter.exclude, ["secret/**"]);
    }

    #[test]
    fn test_pipe_forces_single_worker() {
        let cli = Cli::parse_from(["boundzip", "-p", "data.zip", "--workers", "8"]);
        assert!(cli.is_quiet());
        assert_eq!(cli.extract_config().unwrap().workers, 1);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let cli = Cli::parse_from(["boundzip", "data.zip", "--chunk-size", "0"]);
        assert!(cli.extract_config().is_err());
    }
}

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kube-history")]
#[command(about = "Build per-resource Kubernetes history from audit and node logs")]
pub struct Cli {
    /// Log file to parse (JSON lines, or a YAML list with .yaml/.yml)
    #[arg(required_unless_present = "list_parsers")]
    pub input: Option<PathBuf>,

    /// Parser to run (see --list-parsers)
    #[arg(short, long, required_unless_present = "list_parsers")]
    pub parser: Option<String>,

    /// YAML config file with engine settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Maximum number of log groups parsed in parallel [default: 16]
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Progress report interval in milliseconds [default: 1000]
    #[arg(long)]
    pub progress_interval_ms: Option<u64>,

    /// Write the finished history as YAML to this file instead of printing a timeline
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Parse every log in one group, in order, ignoring the parser's grouping
    #[arg(long)]
    pub sequential: bool,

    /// List available parsers and exit
    #[arg(long)]
    pub list_parsers: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

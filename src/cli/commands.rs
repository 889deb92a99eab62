//! CLI command definitions

use crate::execution::SchedulingStrategy;
use clap::Args;

/// Default cap for `--strategy parallel-limited` without `--max-parallel`
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,

    /// Scheduling strategy (defaults to the one in the pipeline file)
    #[arg(long, value_enum)]
    pub strategy: Option<SchedulingStrategyArg>,

    /// Maximum stages running at once within a group
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_parallel: Option<u64>,

    /// Seconds a process gets to exit after an interrupt before it is killed
    #[arg(long, default_value_t = 5)]
    pub grace_secs: u64,
}

impl RunCommand {
    /// Strategy override requested on the command line, if any
    pub fn scheduling_strategy(&self) -> Option<SchedulingStrategy> {
        let max_parallel = self.max_parallel.map(|n| n as usize);
        match (self.strategy, max_parallel) {
            (Some(SchedulingStrategyArg::Sequential), _) => Some(SchedulingStrategy::Sequential),
            (Some(SchedulingStrategyArg::Parallel), None) => Some(SchedulingStrategy::Parallel),
            (Some(SchedulingStrategyArg::ParallelLimited), None) => {
                Some(SchedulingStrategy::LimitedParallel(DEFAULT_MAX_PARALLEL))
            }
            (Some(_), Some(max)) | (None, Some(max)) => Some(SchedulingStrategy::LimitedParallel(max)),
            (None, None) => None,
        }
    }
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulingStrategyArg {
    Sequential,
    Parallel,
    #[clap(name = "parallel-limited")]
    ParallelLimited,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}

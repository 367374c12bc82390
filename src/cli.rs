//! Command line for the orchestrator binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::router::{ModelTier, QualityPreference};
use crate::state_machine::DispatchMode;

/// Transcription job orchestrator: dispatch, callbacks and audit trail.
#[derive(Debug, Parser)]
#[command(name = "transcription-orchestrator", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModelArg {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl From<ModelArg> for ModelTier {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Tiny => ModelTier::Tiny,
            ModelArg::Base => ModelTier::Base,
            ModelArg::Small => ModelTier::Small,
            ModelArg::Medium => ModelTier::Medium,
            ModelArg::Large => ModelTier::Large,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum QualityArg {
    Speed,
    Balanced,
    Accuracy,
    Precision,
}

impl From<QualityArg> for QualityPreference {
    fn from(arg: QualityArg) -> Self {
        match arg {
            QualityArg::Speed => QualityPreference::Speed,
            QualityArg::Balanced => QualityPreference::Balanced,
            QualityArg::Accuracy => QualityPreference::Accuracy,
            QualityArg::Precision => QualityPreference::Precision,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload an audio file and create a transcription job.
    Submit {
        file: PathBuf,

        /// Wait for the transcript.
        #[arg(long, conflicts_with = "async_mode")]
        sync: bool,

        /// Return once the worker accepted the job.
        #[arg(long = "async")]
        async_mode: bool,

        #[arg(long, value_enum, default_value_t = QualityArg::Balanced)]
        quality: QualityArg,

        #[arg(long)]
        language: Option<String>,

        /// Skip model selection.
        #[arg(long, value_enum)]
        model: Option<ModelArg>,

        /// Join an existing trace instead of starting a new one.
        #[arg(long)]
        correlation_id: Option<String>,

        #[arg(long)]
        diarize: bool,

        /// Audio duration in seconds, estimated from the file when omitted.
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Apply a worker result (JSON file) to a job.
    Callback { job_id: String, result: PathBuf },

    /// Show a job and its events.
    Events {
        job_id: String,

        /// Only events after this sequence number.
        #[arg(long, default_value_t = 0)]
        after: u64,
    },

    /// Show every event of one request.
    Trace { correlation_id: String },

    /// Show the most recent events.
    Recent {
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },

    /// Fail jobs stuck past the processing budget.
    Sweep {
        /// Keep sweeping every `sweep_interval_secs` until Ctrl-C.
        #[arg(long)]
        watch: bool,
    },

    /// Print the tier the selection policy picks.
    Select {
        size_bytes: u64,
        duration_seconds: f64,

        #[arg(long)]
        language: Option<String>,

        #[arg(long, value_enum, default_value_t = QualityArg::Balanced)]
        quality: QualityArg,
    },
}

impl Command {
    /// Dispatch mode requested by `submit` flags.
    pub fn requested_mode(sync: bool, async_mode: bool) -> Option<DispatchMode> {
        match (sync, async_mode) {
            (true, _) => Some(DispatchMode::Sync),
            (_, true) => Some(DispatchMode::Async),
            _ => None,
        }
    }
}

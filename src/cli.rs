use clap::{Parser, ValueEnum};

use exo_perception::core::profile::Condition;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Path to session TOML (written as a commented template if missing)
    #[arg(long, default_value = "exo_session.toml")]
    pub config: String,

    /// Participant identifier (overrides config)
    #[arg(long)]
    pub participant: Option<String>,

    /// Profile dimension to vary (overrides config)
    #[arg(long, value_enum)]
    pub condition: Option<ConditionArg>,

    /// Scripted responses, e.g. "later,later,earlier"; prompts on stdin otherwise
    #[arg(long)]
    pub responses: Option<String>,

    /// Output directory (overrides config)
    #[arg(long)]
    pub output: Option<String>,

    /// Run the loop on the trial thread without real-time pacing
    #[arg(long, default_value_t = false)]
    pub inline: bool,

    /// Simulation seed (overrides config)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Simulated stride length in seconds (overrides config)
    #[arg(long)]
    pub stride_s: Option<f64>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionArg {
    Onset,
    Rise,
    Fall,
}

impl From<ConditionArg> for Condition {
    fn from(arg: ConditionArg) -> Self {
        match arg {
            ConditionArg::Onset => Condition::Onset,
            ConditionArg::Rise => Condition::Rise,
            ConditionArg::Fall => Condition::Fall,
        }
    }
}

pub mod response;
pub mod runner;
pub mod sequencer;
pub mod staircase;

pub use response::{
    ChannelResponses, InterruptiblePrompt, PromptResponses, Response, ResponseSource,
    ScriptedResponses,
};
pub use runner::{ComparisonWindow, InlineRunner, ThreadedRunner, TrialRunner, WindowReport};
pub use sequencer::{SessionOutcome, SessionReport, TrialOutcome, TrialRecord, TrialSequencer};
pub use staircase::{StaircaseController, StaircaseError, StaircaseState, StepOutcome};

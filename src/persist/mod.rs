//! Append-only persistence of control samples, trial records and the final
//! session summary.

pub mod csv_sink;
pub mod writer;

use thiserror::Error;

use crate::core::sample::ControlSample;
use crate::trial::sequencer::{SessionReport, TrialRecord};

pub use csv_sink::CsvSink;
pub use writer::SinkWriter;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persistence I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sink writer thread is gone")]
    Closed,
}

pub trait SessionSink {
    /// `trial_index` is `None` for warm-up and between-trial samples.
    fn append_samples(
        &mut self,
        trial_index: Option<u32>,
        samples: &[ControlSample],
    ) -> Result<(), PersistError>;

    fn append_trial(&mut self, record: &TrialRecord) -> Result<(), PersistError>;

    fn finish(&mut self, report: &SessionReport) -> Result<(), PersistError>;
}

impl<S: SessionSink + ?Sized> SessionSink for Box<S> {
    fn append_samples(
        &mut self,
        trial_index: Option<u32>,
        samples: &[ControlSample],
    ) -> Result<(), PersistError> {
        (**self).append_samples(trial_index, samples)
    }

    fn append_trial(&mut self, record: &TrialRecord) -> Result<(), PersistError> {
        (**self).append_trial(record)
    }

    fn finish(&mut self, report: &SessionReport) -> Result<(), PersistError> {
        (**self).finish(report)
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub batches: Vec<(Option<u32>, Vec<ControlSample>)>,
    pub trials: Vec<TrialRecord>,
    pub report: Option<SessionReport>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> impl Iterator<Item = &ControlSample> {
        self.batches.iter().flat_map(|(_, b)| b.iter())
    }

    pub fn samples_for(&self, trial_index: u32) -> impl Iterator<Item = &ControlSample> {
        self.batches
            .iter()
            .filter(move |(t, _)| *t == Some(trial_index))
            .flat_map(|(_, b)| b.iter())
    }

    pub fn sample_count(&self) -> usize {
        self.batches.iter().map(|(_, b)| b.len()).sum()
    }
}

impl SessionSink for MemorySink {
    fn append_samples(
        &mut self,
        trial_index: Option<u32>,
        samples: &[ControlSample],
    ) -> Result<(), PersistError> {
        self.batches.push((trial_index, samples.to_vec()));
        Ok(())
    }

    fn append_trial(&mut self, record: &TrialRecord) -> Result<(), PersistError> {
        self.trials.push(record.clone());
        Ok(())
    }

    fn finish(&mut self, report: &SessionReport) -> Result<(), PersistError> {
        self.report = Some(report.clone());
        Ok(())
    }
}

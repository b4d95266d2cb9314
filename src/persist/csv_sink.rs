//! Directory of CSV files plus a JSON summary:
//! - `trial_NNN.csv`: samples of one comparison window,
//! - `untracked.csv`: warm-up and between-trial samples,
//! - `trials.csv`: one row per trial,
//! - `summary.json`: the session report.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::core::sample::ControlSample;
use crate::persist::{PersistError, SessionSink};
use crate::trial::sequencer::{SessionReport, TrialRecord};

pub struct CsvSink {
    dir: PathBuf,
    trials: csv::Writer<File>,
    window: Option<(u32, csv::Writer<File>)>,
    untracked: Option<csv::Writer<File>>,
}

impl CsvSink {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, PersistError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let trials = csv::Writer::from_path(dir.join("trials.csv"))?;
        info!(target: "session", "writing session data to {}", dir.display());
        Ok(Self {
            dir,
            trials,
            window: None,
            untracked: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn window_writer(&mut self, trial_index: u32) -> Result<&mut csv::Writer<File>, PersistError> {
        let reuse = matches!(&self.window, Some((idx, _)) if *idx == trial_index);
        if !reuse {
            if let Some((_, mut old)) = self.window.take() {
                old.flush()?;
            }
            let path = self.dir.join(format!("trial_{trial_index:03}.csv"));
            self.window = Some((trial_index, csv::Writer::from_path(path)?));
        }
        match &mut self.window {
            Some((_, w)) => Ok(w),
            None => Err(PersistError::Closed),
        }
    }

    fn untracked_writer(&mut self) -> Result<&mut csv::Writer<File>, PersistError> {
        if self.untracked.is_none() {
            self.untracked = Some(csv::Writer::from_path(self.dir.join("untracked.csv"))?);
        }
        self.untracked.as_mut().ok_or(PersistError::Closed)
    }
}

impl SessionSink for CsvSink {
    fn append_samples(
        &mut self,
        trial_index: Option<u32>,
        samples: &[ControlSample],
    ) -> Result<(), PersistError> {
        let w = match trial_index {
            Some(idx) => self.window_writer(idx)?,
            None => self.untracked_writer()?,
        };
        for s in samples {
            w.serialize(s)?;
        }
        w.flush()?;
        Ok(())
    }

    fn append_trial(&mut self, record: &TrialRecord) -> Result<(), PersistError> {
        self.trials.serialize(record)?;
        self.trials.flush()?;
        Ok(())
    }

    fn finish(&mut self, report: &SessionReport) -> Result<(), PersistError> {
        if let Some((_, w)) = self.window.as_mut() {
            w.flush()?;
        }
        if let Some(w) = self.untracked.as_mut() {
            w.flush()?;
        }
        self.trials.flush()?;
        let json = serde_json::to_string_pretty(report)?;
        fs::write(self.dir.join("summary.json"), json)?;
        Ok(())
    }
}

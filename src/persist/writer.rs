use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use tracing::warn;

use crate::core::sample::ControlSample;
use crate::persist::{PersistError, SessionSink};
use crate::trial::sequencer::{SessionReport, TrialRecord};

enum SinkMessage {
    Samples(Option<u32>, Vec<ControlSample>),
    Trial(TrialRecord),
    Finish(SessionReport),
}

/// Moves a sink onto its own thread so file I/O never stalls the trial side.
/// The first write error is kept and reported by `finish`.
pub struct SinkWriter<S: SessionSink + Send + 'static> {
    tx: Option<Sender<SinkMessage>>,
    handle: Option<JoinHandle<(S, Result<(), PersistError>)>>,
    inner: Option<S>,
}

impl<S: SessionSink + Send + 'static> SinkWriter<S> {
    pub fn spawn(mut sink: S) -> Result<Self, PersistError> {
        let (tx, rx) = crossbeam_channel::unbounded::<SinkMessage>();
        let handle = thread::Builder::new()
            .name("sink-writer".into())
            .spawn(move || {
                let mut result = Ok(());
                while let Ok(msg) = rx.recv() {
                    if result.is_err() {
                        continue;
                    }
                    result = match msg {
                        SinkMessage::Samples(trial, samples) => sink.append_samples(trial, &samples),
                        SinkMessage::Trial(record) => sink.append_trial(&record),
                        SinkMessage::Finish(report) => sink.finish(&report),
                    };
                    if let Err(err) = &result {
                        warn!(target: "session", "sink write failed: {err}");
                    }
                }
                (sink, result)
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            inner: None,
        })
    }

    fn send(&self, msg: SinkMessage) -> Result<(), PersistError> {
        self.tx
            .as_ref()
            .ok_or(PersistError::Closed)?
            .send(msg)
            .map_err(|_| PersistError::Closed)
    }

    /// The wrapped sink, once `finish` has run.
    pub fn into_inner(mut self) -> Option<S> {
        self.inner.take()
    }
}

impl<S: SessionSink + Send + 'static> SessionSink for SinkWriter<S> {
    fn append_samples(
        &mut self,
        trial_index: Option<u32>,
        samples: &[ControlSample],
    ) -> Result<(), PersistError> {
        self.send(SinkMessage::Samples(trial_index, samples.to_vec()))
    }

    fn append_trial(&mut self, record: &TrialRecord) -> Result<(), PersistError> {
        self.send(SinkMessage::Trial(record.clone()))
    }

    fn finish(&mut self, report: &SessionReport) -> Result<(), PersistError> {
        self.send(SinkMessage::Finish(report.clone()))?;
        self.tx.take();
        let handle = self.handle.take().ok_or(PersistError::Closed)?;
        let (sink, result) = handle.join().map_err(|_| PersistError::Closed)?;
        self.inner = Some(sink);
        result
    }
}

impl<S: SessionSink + Send + 'static> Drop for SinkWriter<S> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "session", "sink writer thread panicked");
            }
        }
    }
}

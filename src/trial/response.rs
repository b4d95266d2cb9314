//! Participant responses and the sources that supply them.

use std::collections::VecDeque;
use std::fmt;
use std::io::{BufRead, Write};
use std::str::FromStr;
use std::thread;

use crossbeam_channel::{Receiver, select};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ExoError;

/// Categorical comparison answer relative to the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Response {
    Earlier,
    Same,
    Later,
}

impl Response {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Earlier => "earlier",
            Self::Same => "same",
            Self::Later => "later",
        }
    }

    /// Parse a comma-separated list like "later,later,earlier".
    pub fn parse_list(s: &str) -> Result<Vec<Self>, ExoError> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Response {
    type Err = ExoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "e" | "earlier" => Ok(Self::Earlier),
            "s" | "same" => Ok(Self::Same),
            "l" | "later" => Ok(Self::Later),
            other => Err(ExoError::invalid_config(format!("unknown response {other:?}"))),
        }
    }
}

/// Supplies one response per completed comparison window. Blocks without a
/// timeout; `Ok(None)` means the operator cancelled the session.
pub trait ResponseSource {
    fn next_response(
        &mut self,
        trial_index: u32,
        tested_value: f64,
    ) -> Result<Option<Response>, ExoError>;
}

impl<R: ResponseSource + ?Sized> ResponseSource for Box<R> {
    fn next_response(
        &mut self,
        trial_index: u32,
        tested_value: f64,
    ) -> Result<Option<Response>, ExoError> {
        (**self).next_response(trial_index, tested_value)
    }
}

/// Pre-recorded responses; cancels the session when exhausted.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponses {
    queue: VecDeque<Response>,
}

impl ScriptedResponses {
    pub fn new(responses: impl IntoIterator<Item = Response>) -> Self {
        Self {
            queue: responses.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl ResponseSource for ScriptedResponses {
    fn next_response(&mut self, trial_index: u32, _: f64) -> Result<Option<Response>, ExoError> {
        let next = self.queue.pop_front();
        if next.is_none() {
            info!(target: "session", "scripted responses exhausted at trial {trial_index}");
        }
        Ok(next)
    }
}

/// Line-based prompt over any reader. `q` or end of input cancels.
pub struct PromptResponses<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptResponses<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

fn prompt<W: Write>(output: &mut W, trial_index: u32) -> Result<(), ExoError> {
    write!(
        output,
        "trial {trial_index}: comparison felt [e]arlier, [s]ame or [l]ater? (q to quit) "
    )?;
    output.flush()?;
    Ok(())
}

/// `Ok(None)` quits; `Err` carries the unrecognized answer.
fn interpret(line: &str) -> Result<Option<Response>, &str> {
    let answer = line.trim();
    if answer.eq_ignore_ascii_case("q") {
        return Ok(None);
    }
    answer.parse().map(Some).map_err(|_| answer)
}

impl<R: BufRead, W: Write> ResponseSource for PromptResponses<R, W> {
    fn next_response(
        &mut self,
        trial_index: u32,
        _tested_value: f64,
    ) -> Result<Option<Response>, ExoError> {
        loop {
            prompt(&mut self.output, trial_index)?;
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            match interpret(&line) {
                Ok(response) => return Ok(response),
                Err(answer) => writeln!(self.output, "unrecognized answer {answer:?}")?,
            }
        }
    }
}

/// Prompt fed by a line-reader thread, so a cancel signal (e.g. Ctrl-C)
/// ends the wait without the operator pressing Enter.
pub struct InterruptiblePrompt<W> {
    lines: Receiver<String>,
    cancel: Option<Receiver<()>>,
    output: W,
}

impl<W: Write> InterruptiblePrompt<W> {
    pub fn new(lines: Receiver<String>, cancel: Receiver<()>, output: W) -> Self {
        Self {
            lines,
            cancel: Some(cancel),
            output,
        }
    }

    fn next_line(&mut self) -> Option<String> {
        let Some(cancel) = self.cancel.clone() else {
            return self.lines.recv().ok();
        };
        select! {
            recv(self.lines) -> line => line.ok(),
            recv(cancel) -> signal => match signal {
                Ok(()) => None,
                Err(_) => {
                    // Nobody can cancel any more; wait on input alone.
                    self.cancel = None;
                    self.lines.recv().ok()
                }
            },
        }
    }
}

impl InterruptiblePrompt<std::io::Stdout> {
    /// Reads stdin on a detached `stdin` thread. The thread ends at end of
    /// input or once the prompt is dropped and another line arrives.
    pub fn stdio(cancel: Receiver<()>) -> Result<Self, ExoError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name("stdin".into())
            .spawn(move || {
                for line in std::io::stdin().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                debug!(target: "session", "stdin reader finished");
            })?;
        Ok(Self::new(rx, cancel, std::io::stdout()))
    }
}

impl<W: Write> ResponseSource for InterruptiblePrompt<W> {
    fn next_response(
        &mut self,
        trial_index: u32,
        _tested_value: f64,
    ) -> Result<Option<Response>, ExoError> {
        loop {
            prompt(&mut self.output, trial_index)?;
            let Some(line) = self.next_line() else {
                writeln!(self.output)?;
                return Ok(None);
            };
            match interpret(&line) {
                Ok(response) => return Ok(response),
                Err(answer) => writeln!(self.output, "unrecognized answer {answer:?}")?,
            }
        }
    }
}

/// Responses pushed from another thread; a sent `None` cancels.
#[derive(Debug)]
pub struct ChannelResponses {
    rx: Receiver<Option<Response>>,
}

impl ChannelResponses {
    pub fn new(rx: Receiver<Option<Response>>) -> Self {
        Self { rx }
    }
}

impl ResponseSource for ChannelResponses {
    fn next_response(&mut self, _: u32, _: f64) -> Result<Option<Response>, ExoError> {
        self.rx.recv().map_err(|_| ExoError::ResponseClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_short_and_long_forms() {
        assert_eq!("L".parse::<Response>().unwrap(), Response::Later);
        assert_eq!(" same ".parse::<Response>().unwrap(), Response::Same);
        assert!("sooner".parse::<Response>().is_err());
        assert_eq!(
            Response::parse_list("later, later,earlier").unwrap(),
            vec![Response::Later, Response::Later, Response::Earlier]
        );
    }

    #[test]
    fn scripted_source_cancels_when_empty() {
        let mut src = ScriptedResponses::new([Response::Later]);
        assert_eq!(src.next_response(0, 20.0).unwrap(), Some(Response::Later));
        assert_eq!(src.next_response(1, 22.0).unwrap(), None);
    }

    #[test]
    fn prompt_reprompts_on_garbage() {
        let input = Cursor::new("what\nl\nq\n");
        let mut out = Vec::new();
        let mut src = PromptResponses::new(input, &mut out);
        assert_eq!(src.next_response(0, 20.0).unwrap(), Some(Response::Later));
        assert_eq!(src.next_response(1, 22.0).unwrap(), None);
        drop(src);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("unrecognized answer \"what\""));
        assert_eq!(text.matches("trial 0").count(), 2);
    }

    #[test]
    fn interruptible_prompt_answers_and_cancels_without_input() {
        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
        let mut out = Vec::new();
        let mut src = InterruptiblePrompt::new(line_rx, cancel_rx, &mut out);

        line_tx.send("e".to_string()).unwrap();
        assert_eq!(src.next_response(0, 20.0).unwrap(), Some(Response::Earlier));

        // No line is ever typed; the cancel signal alone ends the wait.
        let canceller = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            cancel_tx.send(()).unwrap();
        });
        assert_eq!(src.next_response(1, 22.0).unwrap(), None);
        canceller.join().unwrap();
        drop(src);
        assert_eq!(String::from_utf8(out).unwrap().matches("trial 1").count(), 1);
    }

    #[test]
    fn interruptible_prompt_outlives_dropped_canceller() {
        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        drop(cancel_tx);
        let mut src = InterruptiblePrompt::new(line_rx, cancel_rx, std::io::sink());
        line_tx.send("later".to_string()).unwrap();
        assert_eq!(src.next_response(0, 20.0).unwrap(), Some(Response::Later));
        drop(line_tx);
        assert_eq!(src.next_response(1, 22.0).unwrap(), None);
    }

    #[test]
    fn channel_source_reports_closed_sender() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut src = ChannelResponses::new(rx);
        tx.send(Some(Response::Earlier)).unwrap();
        assert_eq!(src.next_response(0, 0.0).unwrap(), Some(Response::Earlier));
        drop(tx);
        assert!(matches!(src.next_response(1, 0.0), Err(ExoError::ResponseClosed)));
    }
}

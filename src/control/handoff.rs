//! Per-trial profile handoff between the trial-management side and the
//! control thread. The writer publishes at most once per trial; the reader
//! drains to the newest value at the top of each tick, so a profile is never
//! mutated while the loop holds it.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::core::profile::ProfileParameters;

/// Profile tagged with the trial it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveProfile {
    pub trial_index: u32,
    pub params: Arc<ProfileParameters>,
}

impl ActiveProfile {
    pub fn new(trial_index: u32, params: Arc<ProfileParameters>) -> Self {
        Self {
            trial_index,
            params,
        }
    }
}

/// `None` withdraws assistance.
pub type ProfileUpdate = Option<ActiveProfile>;

#[derive(Debug, Clone)]
pub struct ProfilePublisher {
    tx: Sender<ProfileUpdate>,
}

impl ProfilePublisher {
    /// Returns false once the control side has gone away.
    pub fn publish(&self, update: ProfileUpdate) -> bool {
        self.tx.send(update).is_ok()
    }
}

#[derive(Debug)]
pub struct ProfileSubscriber {
    rx: Receiver<ProfileUpdate>,
}

impl ProfileSubscriber {
    /// Newest pending update, if any arrived since the last call.
    pub fn take_latest(&mut self) -> Option<ProfileUpdate> {
        self.rx.try_iter().last()
    }
}

pub fn profile_channel() -> (ProfilePublisher, ProfileSubscriber) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (ProfilePublisher { tx }, ProfileSubscriber { rx })
}

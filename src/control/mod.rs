pub mod control_loop;
pub mod handoff;
pub mod task;

pub use control_loop::{ControlLoop, LoopStats};
pub use handoff::{ActiveProfile, ProfilePublisher, ProfileSubscriber, profile_channel};
pub use task::{ControlCommand, ControlExit, ControlTask, TaskMeter};

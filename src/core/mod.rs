//! Domain primitives without I/O: time base, samples, gait phase, torque
//! profile and actuator calibration.

pub mod actuation;
pub mod gait;
pub mod profile;
pub mod sample;
pub mod timebase;

//! Hardware transport. The vendor handle blocks, so it lives on its own I/O
//! thread; every request carries a sequence number and the caller waits with
//! `recv_timeout`, discarding replies to requests it already gave up on.
//! The I/O thread in turn skips any queued request that a newer one has
//! superseded, so a command the caller abandoned never reaches the motor
//! after a later one was issued, and a stuck link cannot build a backlog.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::core::actuation::ActuatorCalibration;
use crate::core::sample::InertialSample;
use crate::device::{Baseline, CommandAck, Device, DeviceError, DeviceOp};

/// One streamed frame from the motor driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawFrame {
    pub state_time_ms: u64,
    pub gyro_z_raw: i32,
    pub motor_current_ma: i32,
    pub ankle_ticks: i32,
}

/// Blocking vendor handle.
pub trait ActuatorLink: Send + 'static {
    fn open(&mut self) -> Result<(), DeviceError>;
    fn read_frame(&mut self) -> Result<RawFrame, DeviceError>;
    fn send_current_ma(&mut self, current_ma: i32) -> Result<(), DeviceError>;
    fn close(&mut self);
}

enum Request {
    Read,
    Write(i32),
    Zero { frames: usize, current_ma: i32 },
    Reconnect,
}

enum Reply {
    Frame(RawFrame),
    Written,
    Zeroed { gyro_raw_mean: f64, current_ma_mean: f64 },
    Reconnected,
}

type Envelope = (u64, Request);
type ReplyEnvelope = (u64, Result<Reply, DeviceError>);

pub struct LinkDevice {
    cal: ActuatorCalibration,
    req_tx: Option<Sender<Envelope>>,
    reply_rx: Receiver<ReplyEnvelope>,
    handle: Option<JoinHandle<()>>,
    seq: u64,
    latest_seq: Arc<AtomicU64>,
    zero_frames: usize,
    zero_timeout: Duration,
    last_current_a: Option<f64>,
    last_ankle_ticks: f64,
}

impl LinkDevice {
    /// Spawn the I/O thread and open the link on it.
    pub fn spawn<L: ActuatorLink>(link: L, cal: ActuatorCalibration) -> Result<Self, DeviceError> {
        let (req_tx, req_rx) = crossbeam_channel::unbounded::<Envelope>();
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded::<ReplyEnvelope>();
        let latest_seq = Arc::new(AtomicU64::new(0));
        let latest_for_thread = latest_seq.clone();
        let handle = thread::Builder::new()
            .name("device-io".into())
            .spawn(move || io_loop(link, req_rx, reply_tx, latest_for_thread))
            .map_err(|e| DeviceError::Rejected(format!("spawn device-io: {e}")))?;
        let mut dev = Self {
            cal,
            req_tx: Some(req_tx),
            reply_rx,
            handle: Some(handle),
            seq: 0,
            latest_seq,
            zero_frames: 100,
            zero_timeout: Duration::from_secs(3),
            last_current_a: None,
            last_ankle_ticks: 0.0,
        };
        dev.request(Request::Reconnect, DeviceOp::Reconnect, Duration::from_secs(5))?;
        info!(target: "device", "link open ({:?} side)", cal.side);
        Ok(dev)
    }

    pub fn with_zeroing(mut self, frames: usize, timeout: Duration) -> Self {
        self.zero_frames = frames.max(1);
        self.zero_timeout = timeout;
        self
    }

    pub fn calibration(&self) -> &ActuatorCalibration {
        &self.cal
    }

    /// Requests queued for the I/O thread and not yet picked up.
    pub fn pending_requests(&self) -> usize {
        self.req_tx.as_ref().map_or(0, |tx| tx.len())
    }

    fn request(&mut self, req: Request, op: DeviceOp, timeout: Duration) -> Result<Reply, DeviceError> {
        self.seq += 1;
        let seq = self.seq;
        let tx = self.req_tx.as_ref().ok_or(DeviceError::Disconnected)?;
        self.latest_seq.store(seq, Ordering::SeqCst);
        tx.send((seq, req)).map_err(|_| DeviceError::Disconnected)?;
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            match self.reply_rx.recv_timeout(left) {
                Ok((id, reply)) if id == seq => return reply,
                Ok((id, _)) => {
                    debug!(target: "device", "dropping stale reply {id} (waiting for {seq})");
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(DeviceError::Timeout { op, after: timeout });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(DeviceError::Disconnected),
            }
        }
    }

    fn frame_to_sample(&mut self, frame: RawFrame) -> InertialSample {
        self.last_current_a = Some(frame.motor_current_ma.abs() as f64 / 1_000.0);
        self.last_ankle_ticks = frame.ankle_ticks as f64;
        InertialSample::new(
            frame.state_time_ms as f64 / 1_000.0,
            self.cal.gyro_to_units(frame.gyro_z_raw) * self.cal.side.sign() as f64,
        )
    }
}

impl Device for LinkDevice {
    fn read_sample(&mut self, timeout: Duration) -> Result<InertialSample, DeviceError> {
        match self.request(Request::Read, DeviceOp::Read, timeout)? {
            Reply::Frame(frame) => Ok(self.frame_to_sample(frame)),
            _ => Err(DeviceError::Rejected("unexpected reply to read".into())),
        }
    }

    fn write_command(
        &mut self,
        torque_nm: f64,
        timeout: Duration,
    ) -> Result<CommandAck, DeviceError> {
        let ma = self.cal.command_ma(torque_nm, self.last_ankle_ticks);
        match self.request(Request::Write(ma), DeviceOp::Write, timeout)? {
            Reply::Written => Ok(CommandAck {
                measured_current_a: self.last_current_a,
            }),
            _ => Err(DeviceError::Rejected("unexpected reply to write".into())),
        }
    }

    fn zero(&mut self) -> Result<Baseline, DeviceError> {
        let req = Request::Zero {
            frames: self.zero_frames,
            current_ma: self.cal.zeroing_ma.round() as i32 * self.cal.side.sign(),
        };
        match self.request(req, DeviceOp::Zero, self.zero_timeout)? {
            Reply::Zeroed {
                gyro_raw_mean,
                current_ma_mean,
            } => {
                let baseline = Baseline {
                    gyro_z_bias: gyro_raw_mean / self.cal.gyro_lsb_per_unit
                        * self.cal.side.sign() as f64,
                    current_offset_a: current_ma_mean.abs() / 1_000.0
                        - self.cal.zeroing_ma / 1_000.0,
                };
                info!(target: "device", "zeroed: {baseline:?}");
                Ok(baseline)
            }
            _ => Err(DeviceError::Rejected("unexpected reply to zero".into())),
        }
    }

    fn reconnect(&mut self) -> Result<(), DeviceError> {
        match self.request(Request::Reconnect, DeviceOp::Reconnect, Duration::from_secs(5))? {
            Reply::Reconnected => Ok(()),
            _ => Err(DeviceError::Rejected("unexpected reply to reconnect".into())),
        }
    }
}

impl Drop for LinkDevice {
    fn drop(&mut self) {
        // Closing the request channel ends the I/O loop.
        self.req_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "device", "device-io thread panicked");
            }
        }
    }
}

fn io_loop<L: ActuatorLink>(
    mut link: L,
    req_rx: Receiver<Envelope>,
    reply_tx: Sender<ReplyEnvelope>,
    latest_seq: Arc<AtomicU64>,
) {
    let mut skipped: u64 = 0;
    while let Ok((seq, req)) = req_rx.recv() {
        if seq < latest_seq.load(Ordering::SeqCst) {
            // The caller has moved on; nobody waits for this reply.
            skipped += 1;
            continue;
        }
        if skipped > 0 {
            debug!(target: "device", "skipped {skipped} superseded requests before {seq}");
            skipped = 0;
        }
        let reply = match req {
            Request::Read => link.read_frame().map(Reply::Frame),
            Request::Write(ma) => link.send_current_ma(ma).map(|_| Reply::Written),
            Request::Zero { frames, current_ma } => zero_on_link(&mut link, frames, current_ma),
            Request::Reconnect => {
                link.close();
                link.open().map(|_| Reply::Reconnected)
            }
        };
        if reply_tx.send((seq, reply)).is_err() {
            break;
        }
    }
    link.close();
}

fn zero_on_link<L: ActuatorLink>(link: &mut L, frames: usize, current_ma: i32) -> Result<Reply, DeviceError> {
    link.send_current_ma(current_ma)?;
    let mut gyro_sum = 0.0;
    let mut current_sum = 0.0;
    for _ in 0..frames {
        let frame = link.read_frame()?;
        gyro_sum += frame.gyro_z_raw as f64;
        current_sum += frame.motor_current_ma as f64;
    }
    let n = frames.max(1) as f64;
    Ok(Reply::Zeroed {
        gyro_raw_mean: gyro_sum / n,
        current_ma_mean: current_sum / n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::actuation::Side;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Every operation blocks for `delay` ms; sent currents are logged.
    struct FakeLink {
        t_ms: u64,
        delay: Arc<AtomicU64>,
        last_ma: i32,
        opens: u32,
        sent: Arc<Mutex<Vec<i32>>>,
    }

    impl FakeLink {
        fn new(delay: Arc<AtomicU64>) -> Self {
            Self {
                t_ms: 0,
                delay,
                last_ma: 0,
                opens: 0,
                sent: Arc::default(),
            }
        }

        fn stall(&self) {
            let delay = self.delay.load(Ordering::Relaxed);
            if delay > 0 {
                thread::sleep(Duration::from_millis(delay));
            }
        }
    }

    impl ActuatorLink for FakeLink {
        fn open(&mut self) -> Result<(), DeviceError> {
            self.opens += 1;
            Ok(())
        }

        fn read_frame(&mut self) -> Result<RawFrame, DeviceError> {
            self.stall();
            self.t_ms += 10;
            Ok(RawFrame {
                state_time_ms: self.t_ms,
                gyro_z_raw: 328,
                motor_current_ma: self.last_ma,
                ankle_ticks: 0,
            })
        }

        fn send_current_ma(&mut self, current_ma: i32) -> Result<(), DeviceError> {
            self.stall();
            self.last_ma = current_ma;
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(current_ma);
            }
            Ok(())
        }

        fn close(&mut self) {}
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[test]
    fn frames_are_scaled_and_signed() {
        let delay = Arc::new(AtomicU64::new(0));
        let cal = ActuatorCalibration::for_side(Side::Right);
        let mut dev = LinkDevice::spawn(FakeLink::new(delay), cal).unwrap();
        let s = dev.read_sample(TIMEOUT).unwrap();
        assert_eq!(s.timestamp_s, 0.01);
        assert!((s.gyro_z + 10.0).abs() < 1e-9);
    }

    #[test]
    fn write_converts_torque_to_driver_current() {
        let delay = Arc::new(AtomicU64::new(0));
        let cal = ActuatorCalibration::default();
        let mut dev = LinkDevice::spawn(FakeLink::new(delay), cal).unwrap();
        dev.write_command(0.0, TIMEOUT).unwrap();
        dev.read_sample(TIMEOUT).unwrap();
        let ack = dev.write_command(5.0, TIMEOUT).unwrap();
        // Ack carries the current seen on the latest frame (no-slack level).
        assert_eq!(ack.measured_current_a, Some(1.2));
    }

    #[test]
    fn slow_link_times_out_and_late_reply_is_discarded() {
        let delay = Arc::new(AtomicU64::new(60));
        let cal = ActuatorCalibration::default();
        let mut dev = LinkDevice::spawn(FakeLink::new(delay.clone()), cal).unwrap();
        let err = dev.read_sample(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_timeout());
        delay.store(0, Ordering::Relaxed);
        // The late frame (t = 10 ms) must not be returned for this request.
        let s = dev.read_sample(TIMEOUT).unwrap();
        assert_eq!(s.timestamp_s, 0.02);
    }

    #[test]
    fn zero_averages_frames() {
        let delay = Arc::new(AtomicU64::new(0));
        let cal = ActuatorCalibration::default();
        let mut dev = LinkDevice::spawn(FakeLink::new(delay), cal)
            .unwrap()
            .with_zeroing(10, TIMEOUT);
        let b = dev.zero().unwrap();
        assert!((b.gyro_z_bias - 10.0).abs() < 1e-9);
        assert!(b.current_offset_a.abs() < 1e-9);
    }

    #[test]
    fn abandoned_commands_are_skipped_on_a_stuck_link() {
        let delay = Arc::new(AtomicU64::new(20));
        let link = FakeLink::new(delay.clone());
        let sent = link.sent.clone();
        let cal = ActuatorCalibration::default();
        let mut dev = LinkDevice::spawn(link, cal).unwrap();
        let short = Duration::from_millis(2);

        // Assist command issued while the link is busy, then the fail-safe.
        assert!(dev.read_sample(short).unwrap_err().is_timeout());
        assert!(dev.write_command(15.0, short).unwrap_err().is_timeout());
        assert!(dev.write_command(0.0, short).unwrap_err().is_timeout());
        // Halted ticks keep polling the stuck link.
        for _ in 0..50 {
            let _ = dev.read_sample(short);
            let _ = dev.write_command(0.0, short);
        }
        assert!(dev.pending_requests() < 20, "{} queued", dev.pending_requests());

        delay.store(0, Ordering::Relaxed);
        let started = Instant::now();
        dev.reconnect().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        dev.write_command(0.0, TIMEOUT).unwrap();

        let no_slack = cal.command_ma(0.0, 0.0);
        let sent = sent.lock().unwrap().clone();
        assert_eq!(sent.last(), Some(&no_slack));
        assert!(sent.iter().all(|&ma| ma == no_slack), "{sent:?}");
    }
}

//! Connection supervision.
//!
//! `ConnectionSupervisor` drives a `DecodeBackend` through an explicit four-state machine:
//!
//! ```text
//!   Connecting --first frame--> Live --Failed / StreamEnded--> Reconnecting
//!       ^                                                       |     |
//!       +---------------- backoff elapsed, open() --------------+     |
//!                                                                     v
//!                                     retry ceiling exceeded -> PermanentlyFailed
//! ```
//!
//! Open failures and early failures while `Connecting` loop back into `Reconnecting` with
//! the retry count and the backoff advanced. Nothing here sleeps: a pending backoff simply
//! makes `poll` return `None` until the deadline passes.

use rand::Rng;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{BackendFactory, DecodeBackend, FramePoll};
use crate::config::{
    Credentials, EndOfStreamPolicy, StreamUri, SupervisorPolicy, MAX_POLICY_DURATION,
};
use crate::error::{FailureReason, StreamError};
use crate::frame::DeviceBuffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Live,
    Reconnecting,
    PermanentlyFailed,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Live => 1,
            ConnectionState::Reconnecting => 2,
            ConnectionState::PermanentlyFailed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Live,
            2 => ConnectionState::Reconnecting,
            _ => ConnectionState::PermanentlyFailed,
        }
    }
}

/// Lock-free snapshot of a supervisor's state, readable from any thread.
#[derive(Clone, Debug)]
pub struct LivenessHandle {
    state: Arc<AtomicU8>,
}

impl LivenessHandle {
    fn new(state: ConnectionState) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(state.to_u8())),
        }
    }

    fn set(&self, state: ConnectionState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True in every state except `Live`.
    pub fn is_reconnecting(&self) -> bool {
        self.state() != ConnectionState::Live
    }

    /// True once the supervisor has given up for good.
    pub fn is_failed(&self) -> bool {
        self.state() == ConnectionState::PermanentlyFailed
    }
}

// ----------------------------------------------------------------------------
// Backoff
// ----------------------------------------------------------------------------

/// Capped exponential backoff with proportional jitter.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: if jitter.is_nan() {
                0.0
            } else {
                jitter.clamp(0.0, 1.0)
            },
            attempt: 0,
        }
    }

    pub fn from_policy(policy: &SupervisorPolicy) -> Self {
        Self::new(policy.backoff_base, policy.backoff_cap, policy.backoff_jitter)
    }

    /// Delay before the next attempt. Each call doubles the nominal delay up to the cap;
    /// jitter then shortens it by up to `jitter` of its length.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        let nominal = self.base.saturating_mul(factor).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return nominal;
        }
        let shrink = self.jitter * rand::thread_rng().gen::<f64>();
        nominal.mul_f64(1.0 - shrink)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Statistics for a supervised stream.
#[derive(Clone, Debug)]
pub struct StreamStats {
    pub uri: String,
    pub state: ConnectionState,
    pub frames_delivered: u64,
    pub frames_rejected: u64,
    pub reconnects: u64,
    pub retries: u32,
    pub generation: u64,
    pub last_error: Option<StreamError>,
}

// ----------------------------------------------------------------------------
// Supervisor
// ----------------------------------------------------------------------------

pub struct ConnectionSupervisor {
    uri: StreamUri,
    credentials: Option<Credentials>,
    factory: Box<dyn BackendFactory>,
    backend: Option<Box<dyn DecodeBackend>>,
    policy: SupervisorPolicy,
    state: ConnectionState,
    liveness: LivenessHandle,
    backoff: Backoff,
    retries: u32,
    next_attempt_at: Option<Instant>,
    attempt_started_at: Instant,
    last_frame_at: Option<Instant>,
    last_sequence: Option<u64>,
    last_pts: Option<Duration>,
    generation: u64,
    last_error: Option<StreamError>,
    frames_delivered: u64,
    frames_rejected: u64,
    reconnects: u64,
    closed: bool,
}

impl ConnectionSupervisor {
    /// Create a supervisor in `Connecting`. No connection is attempted until the first poll.
    pub fn new(
        uri: StreamUri,
        credentials: Option<Credentials>,
        factory: Box<dyn BackendFactory>,
        policy: SupervisorPolicy,
    ) -> Self {
        let state = ConnectionState::Connecting;
        Self {
            uri,
            credentials,
            factory,
            backend: None,
            backoff: Backoff::from_policy(&policy),
            policy,
            state,
            liveness: LivenessHandle::new(state),
            retries: 0,
            next_attempt_at: None,
            attempt_started_at: Instant::now(),
            last_frame_at: None,
            last_sequence: None,
            last_pts: None,
            generation: 0,
            last_error: None,
            frames_delivered: 0,
            frames_rejected: 0,
            reconnects: 0,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn liveness(&self) -> LivenessHandle {
        self.liveness.clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.liveness.is_reconnecting()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn last_error(&self) -> Option<&StreamError> {
        self.last_error.as_ref()
    }

    /// Instant of the next scheduled connection attempt, if one is pending.
    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            uri: self.uri.redacted(),
            state: self.state,
            frames_delivered: self.frames_delivered,
            frames_rejected: self.frames_rejected,
            reconnects: self.reconnects,
            retries: self.retries,
            generation: self.generation,
            last_error: self.last_error.clone(),
        }
    }

    /// Advance the machine by one step and return a frame if one is ready.
    ///
    /// Returns within the backend's poll timeout; backoff waits never block.
    pub fn poll(&mut self) -> Option<DeviceBuffer> {
        if self.closed || self.state == ConnectionState::PermanentlyFailed {
            return None;
        }
        if self.backend.is_none() && !self.try_connect() {
            return None;
        }
        self.poll_backend()
    }

    /// Release the backend. Idempotent; later polls return `None`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.teardown();
        self.closed = true;
        log::info!("stream {} closed", self.uri);
    }

    fn try_connect(&mut self) -> bool {
        if let Some(at) = self.next_attempt_at {
            if Instant::now() < at {
                return false;
            }
        }
        self.next_attempt_at = None;
        self.transition(ConnectionState::Connecting);
        log::info!(
            "connecting to {} (attempt {})",
            self.uri,
            self.retries.saturating_add(1)
        );

        match self.factory.open(&self.uri, self.credentials.as_ref()) {
            Ok(backend) => {
                self.generation += 1;
                log::debug!(
                    "opened {} backend for {} (generation {})",
                    backend.name(),
                    self.uri,
                    self.generation
                );
                self.backend = Some(backend);
                self.attempt_started_at = Instant::now();
                self.last_frame_at = None;
                self.last_sequence = None;
                self.last_pts = None;
                true
            }
            Err(err) if err.is_permanent() => {
                log::error!("cannot open {}: {}", self.uri, err);
                self.give_up(StreamError::Open(err));
                false
            }
            Err(err) => {
                log::warn!("cannot open {}: {}", self.uri, err);
                self.schedule_retry(StreamError::Open(err));
                false
            }
        }
    }

    fn poll_backend(&mut self) -> Option<DeviceBuffer> {
        let backend = self.backend.as_mut()?;
        match backend.poll_frame() {
            FramePoll::Frame(mut buffer) => {
                if !self.accept(&buffer) {
                    // Rejected buffers do not count as progress for the watchdogs.
                    self.frames_rejected += 1;
                    drop(buffer);
                    self.check_deadlines();
                    return None;
                }
                buffer.stamp(self.generation);
                self.last_frame_at = Some(Instant::now());
                self.frames_delivered += 1;
                if self.state != ConnectionState::Live {
                    if self.generation > 1 {
                        self.reconnects += 1;
                    }
                    self.retries = 0;
                    self.backoff.reset();
                    self.transition(ConnectionState::Live);
                }
                Some(buffer)
            }
            FramePoll::NoFrameYet => {
                self.check_deadlines();
                None
            }
            FramePoll::StreamEnded => {
                match self.policy.end_of_stream {
                    EndOfStreamPolicy::Reconnect => self.fail(FailureReason::EndOfStream),
                    EndOfStreamPolicy::Terminal => {
                        log::info!("stream {} ended", self.uri);
                        self.give_up(StreamError::StreamFailure(FailureReason::EndOfStream));
                    }
                }
                None
            }
            FramePoll::Failed(reason) => {
                self.fail(reason);
                None
            }
        }
    }

    /// Within one pipeline, sequence numbers must increase and timestamps must not go back.
    fn accept(&mut self, buffer: &DeviceBuffer) -> bool {
        if let Some(last) = self.last_sequence {
            if buffer.sequence() <= last {
                log::debug!(
                    "dropping repeated buffer {} (last delivered {})",
                    buffer.sequence(),
                    last
                );
                return false;
            }
        }
        if let (Some(last), Some(pts)) = (self.last_pts, buffer.pts()) {
            if pts < last {
                log::debug!("dropping out-of-order buffer pts={:?} < {:?}", pts, last);
                return false;
            }
        }
        self.last_sequence = Some(buffer.sequence());
        if let Some(pts) = buffer.pts() {
            self.last_pts = Some(pts);
        }
        true
    }

    fn check_deadlines(&mut self) {
        let now = Instant::now();
        match self.state {
            ConnectionState::Connecting => {
                if now.duration_since(self.attempt_started_at) >= self.policy.connect_timeout {
                    self.fail(FailureReason::Timeout(self.policy.connect_timeout));
                }
            }
            ConnectionState::Live => {
                let last = self.last_frame_at.unwrap_or(self.attempt_started_at);
                if now.duration_since(last) >= self.policy.stall_timeout {
                    self.fail(FailureReason::Timeout(self.policy.stall_timeout));
                }
            }
            ConnectionState::Reconnecting | ConnectionState::PermanentlyFailed => {}
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        log::warn!("stream {} failed: {}", self.uri, reason);
        self.teardown();
        self.schedule_retry(StreamError::StreamFailure(reason));
    }

    fn schedule_retry(&mut self, err: StreamError) {
        self.retries = self.retries.saturating_add(1);
        if let Some(max) = self.policy.max_retries {
            if self.retries > max {
                let attempts = self.retries;
                self.give_up(StreamError::PermanentFailure {
                    attempts,
                    last: Box::new(err),
                });
                return;
            }
        }
        let delay = self.backoff.next_delay();
        let now = Instant::now();
        self.next_attempt_at = Some(
            now.checked_add(delay)
                .or_else(|| now.checked_add(MAX_POLICY_DURATION))
                .unwrap_or(now),
        );
        self.last_error = Some(err);
        self.transition(ConnectionState::Reconnecting);
        log::info!(
            "reconnecting to {} in {:?} (retry {})",
            self.uri,
            delay,
            self.retries
        );
    }

    fn give_up(&mut self, err: StreamError) {
        self.teardown();
        log::error!("giving up on {}: {}", self.uri, err);
        self.last_error = Some(err);
        self.next_attempt_at = None;
        self.transition(ConnectionState::PermanentlyFailed);
    }

    fn teardown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
            log::debug!(
                "closed {} backend for {} (generation {})",
                backend.name(),
                self.uri,
                self.generation
            );
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            log::info!("stream {}: {:?} -> {:?}", self.uri, self.state, next);
            self.state = next;
        }
        self.liveness.set(next);
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::scripted::{Script, ScriptedFactory, Session};
    use crate::error::OpenError;

    fn policy() -> SupervisorPolicy {
        SupervisorPolicy {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
            backoff_jitter: 0.0,
            ..SupervisorPolicy::default()
        }
    }

    fn supervisor(script: Script, policy: SupervisorPolicy) -> ConnectionSupervisor {
        let uri = StreamUri::parse("rtsp://camera.test/stream").unwrap();
        let factory = ScriptedFactory::new(script);
        ConnectionSupervisor::new(uri, None, Box::new(factory), policy)
    }

    fn poll_until<F: Fn(&ConnectionSupervisor) -> bool>(sup: &mut ConnectionSupervisor, done: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done(&*sup) {
            assert!(Instant::now() < deadline, "condition not reached");
            drop(sup.poll());
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(5), 0.0);
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![200, 400, 800, 1600, 3200, 5000, 5000, 5000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }

    #[test]
    fn backoff_jitter_only_shortens() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(100), 0.5);
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(100));
            assert!(delay >= Duration::from_millis(50));
        }
    }

    #[test]
    fn nan_jitter_is_treated_as_none() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(40), f64::NAN);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
    }

    #[test]
    fn oversized_backoff_does_not_overflow_the_retry_deadline() {
        let huge = SupervisorPolicy {
            backoff_base: Duration::MAX,
            backoff_cap: Duration::MAX,
            backoff_jitter: 0.0,
            ..SupervisorPolicy::default()
        };
        let script = Script::new().refuse(OpenError::TransportUnreachable("down".into()));
        let mut sup = supervisor(script, huge);
        assert!(sup.poll().is_none());
        assert_eq!(sup.state(), ConnectionState::Reconnecting);
        assert!(sup.next_attempt_at().is_some());
        assert!(sup.poll().is_none());
    }

    #[test]
    fn starts_connecting_and_goes_live_on_first_frame() {
        let mut sup = supervisor(Script::new().session(Session::new().frames(2)), policy());
        assert_eq!(sup.state(), ConnectionState::Connecting);
        assert!(sup.is_reconnecting());

        let frame = sup.poll().expect("first frame");
        assert_eq!(frame.generation(), 1);
        assert_eq!(sup.state(), ConnectionState::Live);
        assert!(!sup.is_reconnecting());
    }

    #[test]
    fn failure_moves_to_reconnecting_and_schedules_backoff() {
        let script = Script::new().session(
            Session::new()
                .frames(1)
                .fail(FailureReason::TransportDropped("reset".into())),
        );
        let mut sup = supervisor(script, policy());
        assert!(sup.poll().is_some());
        assert!(sup.poll().is_none());
        assert_eq!(sup.state(), ConnectionState::Reconnecting);
        assert!(sup.next_attempt_at().is_some());
        assert_eq!(sup.retries(), 1);
        assert!(matches!(
            sup.last_error(),
            Some(StreamError::StreamFailure(FailureReason::TransportDropped(_)))
        ));
    }

    #[test]
    fn refused_opens_loop_in_reconnecting_until_ceiling() {
        let script = Script::new()
            .refuse(OpenError::TransportUnreachable("refused".into()))
            .refuse(OpenError::TransportUnreachable("refused".into()))
            .refuse(OpenError::TransportUnreachable("refused".into()));
        let mut sup = supervisor(
            script,
            SupervisorPolicy {
                max_retries: Some(2),
                ..policy()
            },
        );
        poll_until(&mut sup, |s| s.state() == ConnectionState::PermanentlyFailed);
        assert!(sup.is_reconnecting());
        assert!(sup.liveness().is_failed());
        match sup.last_error() {
            Some(StreamError::PermanentFailure { attempts, .. }) => assert_eq!(*attempts, 3),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(sup.poll().is_none());
    }

    #[test]
    fn hardware_unavailable_is_terminal_without_retry() {
        let script =
            Script::new().refuse(OpenError::HardwareUnavailable("no decoder".into()));
        let mut sup = supervisor(script, policy());
        assert!(sup.poll().is_none());
        assert_eq!(sup.state(), ConnectionState::PermanentlyFailed);
        assert_eq!(sup.retries(), 0);
    }

    #[test]
    fn end_of_stream_policy_is_honoured() {
        let script = Script::new().session(Session::new().frames(1).end());
        let mut sup = supervisor(
            script,
            SupervisorPolicy {
                end_of_stream: EndOfStreamPolicy::Terminal,
                ..policy()
            },
        );
        assert!(sup.poll().is_some());
        assert!(sup.poll().is_none());
        assert_eq!(sup.state(), ConnectionState::PermanentlyFailed);

        let script = Script::new().session(Session::new().frames(1).end());
        let mut sup = supervisor(script, policy());
        assert!(sup.poll().is_some());
        assert!(sup.poll().is_none());
        assert_eq!(sup.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn connect_timeout_feeds_the_retry_path() {
        let script = Script::new().session(Session::new());
        let mut sup = supervisor(
            script,
            SupervisorPolicy {
                connect_timeout: Duration::from_millis(20),
                ..policy()
            },
        );
        poll_until(&mut sup, |s| s.state() == ConnectionState::Reconnecting);
        assert!(sup.last_error().map_or(false, StreamError::is_timeout));
    }

    #[test]
    fn stalled_live_stream_is_restarted() {
        let script = Script::new().session(Session::new().frames(1));
        let mut sup = supervisor(
            script,
            SupervisorPolicy {
                stall_timeout: Duration::from_millis(20),
                ..policy()
            },
        );
        assert!(sup.poll().is_some());
        poll_until(&mut sup, |s| s.state() != ConnectionState::Live);
        assert!(sup.last_error().map_or(false, StreamError::is_timeout));
    }

    #[test]
    fn retry_count_resets_once_live_again() {
        let script = Script::new()
            .session(Session::new().frames(1).fail(FailureReason::Decode("bad nal".into())))
            .refuse(OpenError::TransportUnreachable("down".into()))
            .session(Session::new().frames(1));
        let mut sup = supervisor(script, policy());
        assert!(sup.poll().is_some());
        poll_until(&mut sup, |s| s.retries() == 2);
        poll_until(&mut sup, |s| s.state() == ConnectionState::Live);
        assert_eq!(sup.retries(), 0);
        let stats = sup.stats();
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.generation, 2);
    }

    #[test]
    fn close_releases_backend_and_stops_polling() {
        let factory = ScriptedFactory::new(Script::new().session(Session::new().frames(5)));
        let ledger = factory.ledger();
        let uri = StreamUri::parse("rtsp://camera.test/stream").unwrap();
        let mut sup = ConnectionSupervisor::new(uri, None, Box::new(factory), policy());
        assert!(sup.poll().is_some());
        sup.close();
        sup.close();
        assert_eq!(ledger.opens(), 1);
        assert_eq!(ledger.closes(), 1);
        assert!(sup.poll().is_none());
    }
}

//! Scripted decode backend.
//!
//! Plays back a fixed list of connection attempts, each either refused or a session of
//! frame/idle/end/fail events. Frames live in a small pool of fixed slots that stand in for
//! decoder surfaces: a slot stays leased while its `DeviceBuffer` is alive, and a poll with
//! every slot leased yields `NoFrameYet`, just as a full hardware pool would.
//!
//! `stub://` URIs are served by an endless session of synthetic frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{BackendFactory, DecodeBackend, FramePoll, PipelineState};
use crate::config::{Credentials, StreamUri};
use crate::error::{FailureReason, OpenError};
use crate::frame::{DeviceBuffer, FrameGeometry, PixelLayout};

const DEFAULT_WIDTH: usize = 640;
const DEFAULT_HEIGHT: usize = 480;
const DEFAULT_SLOTS: usize = 4;
/// Nominal spacing of presentation timestamps (25 fps).
const FRAME_INTERVAL_MS: u64 = 40;

#[derive(Clone, Debug, PartialEq)]
pub enum ScriptEvent {
    Frame,
    Idle,
    End,
    Fail(FailureReason),
}

/// Events produced by one opened pipeline.
#[derive(Clone, Debug, Default)]
pub struct Session {
    events: VecDeque<ScriptEvent>,
    endless: bool,
}

impl Session {
    /// A session that idles once its events run out.
    pub fn new() -> Self {
        Self::default()
    }

    /// A session that produces frames forever once its events run out.
    pub fn endless() -> Self {
        Self {
            events: VecDeque::new(),
            endless: true,
        }
    }

    pub fn frames(mut self, count: usize) -> Self {
        self.events
            .extend(std::iter::repeat(ScriptEvent::Frame).take(count));
        self
    }

    pub fn idle(mut self, polls: usize) -> Self {
        self.events
            .extend(std::iter::repeat(ScriptEvent::Idle).take(polls));
        self
    }

    pub fn end(mut self) -> Self {
        self.events.push_back(ScriptEvent::End);
        self
    }

    pub fn fail(mut self, reason: FailureReason) -> Self {
        self.events.push_back(ScriptEvent::Fail(reason));
        self
    }
}

#[derive(Clone, Debug)]
enum Attempt {
    Open(Session),
    Refuse(OpenError),
}

/// Ordered connection attempts. Attempts beyond the end of the script are refused as
/// unreachable.
#[derive(Clone, Debug, Default)]
pub struct Script {
    attempts: VecDeque<Attempt>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session: Session) -> Self {
        self.attempts.push_back(Attempt::Open(session));
        self
    }

    pub fn refuse(mut self, err: OpenError) -> Self {
        self.attempts.push_back(Attempt::Refuse(err));
        self
    }
}

/// Counters shared between a factory, its backends and test code.
#[derive(Debug, Default)]
pub struct BackendLedger {
    open_attempts: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    leased: AtomicUsize,
}

impl BackendLedger {
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Pipelines opened and not yet closed.
    pub fn active(&self) -> usize {
        self.opens().saturating_sub(self.closes())
    }

    /// Slots currently held by live buffers, across all pipelines.
    pub fn leased_slots(&self) -> usize {
        self.leased.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Slot pool
// ----------------------------------------------------------------------------

struct SlotPool {
    slots: Mutex<Vec<Box<[u8]>>>,
    free: Mutex<Vec<usize>>,
    ledger: Arc<BackendLedger>,
}

impl SlotPool {
    fn new(count: usize, slot_len: usize, ledger: Arc<BackendLedger>) -> Arc<Self> {
        let slots = (0..count)
            .map(|_| vec![0u8; slot_len].into_boxed_slice())
            .collect();
        Arc::new(Self {
            slots: Mutex::new(slots),
            free: Mutex::new((0..count).rev().collect()),
            ledger,
        })
    }

    /// Lease a free slot, fill it with `fill` and return its address.
    fn lease(self: &Arc<Self>, fill: u8) -> Option<(SlotLease, u64)> {
        let index = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop()?;
        let ptr = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = &mut slots[index];
            slot.fill(fill);
            slot.as_ptr() as u64
        };
        self.ledger.leased.fetch_add(1, Ordering::SeqCst);
        Some((
            SlotLease {
                pool: Arc::clone(self),
                index,
            },
            ptr,
        ))
    }

    fn release(&self, index: usize) {
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(index);
        self.ledger.leased.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SlotLease {
    pool: Arc<SlotPool>,
    index: usize,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

pub struct ScriptedFactory {
    attempts: VecDeque<Attempt>,
    endless: bool,
    geometry: FrameGeometry,
    slots: usize,
    device_index: i32,
    ledger: Arc<BackendLedger>,
    next_picture: Arc<AtomicU64>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            attempts: script.attempts,
            endless: false,
            geometry: default_geometry(),
            slots: DEFAULT_SLOTS,
            device_index: 0,
            ledger: Arc::new(BackendLedger::default()),
            next_picture: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Synthetic camera: every open succeeds with an endless session.
    pub fn endless() -> Self {
        let mut factory = Self::new(Script::new());
        factory.endless = true;
        factory
    }

    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots.max(1);
        self
    }

    pub fn with_device_index(mut self, device_index: i32) -> Self {
        self.device_index = device_index;
        self
    }

    pub fn ledger(&self) -> Arc<BackendLedger> {
        Arc::clone(&self.ledger)
    }

    fn next_attempt(&mut self) -> Attempt {
        if self.endless {
            return Attempt::Open(Session::endless());
        }
        self.attempts.pop_front().unwrap_or_else(|| {
            Attempt::Refuse(OpenError::TransportUnreachable(
                "no more scripted connections".to_string(),
            ))
        })
    }
}

impl BackendFactory for ScriptedFactory {
    fn open(
        &mut self,
        uri: &StreamUri,
        _credentials: Option<&Credentials>,
    ) -> Result<Box<dyn DecodeBackend>, OpenError> {
        self.ledger.open_attempts.fetch_add(1, Ordering::SeqCst);
        let session = match self.next_attempt() {
            Attempt::Open(session) => session,
            Attempt::Refuse(err) => return Err(err),
        };
        self.ledger.opens.fetch_add(1, Ordering::SeqCst);
        log::debug!("scripted pipeline opened for {}", uri);
        Ok(Box::new(ScriptedBackend {
            session,
            geometry: self.geometry,
            device_index: self.device_index,
            pool: SlotPool::new(self.slots, self.geometry.packed_len(), Arc::clone(&self.ledger)),
            ledger: Arc::clone(&self.ledger),
            next_picture: Arc::clone(&self.next_picture),
            sequence: 0,
            state: PipelineState::Running,
            closed: false,
        }))
    }
}

fn default_geometry() -> FrameGeometry {
    FrameGeometry::packed(DEFAULT_WIDTH, DEFAULT_HEIGHT, PixelLayout::Bgr)
        .unwrap_or_else(|_| unreachable!("default geometry is non-empty"))
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

struct ScriptedBackend {
    session: Session,
    geometry: FrameGeometry,
    device_index: i32,
    pool: Arc<SlotPool>,
    ledger: Arc<BackendLedger>,
    next_picture: Arc<AtomicU64>,
    sequence: u64,
    state: PipelineState,
    closed: bool,
}

impl ScriptedBackend {
    fn next_event(&mut self) -> ScriptEvent {
        match self.session.events.pop_front() {
            Some(event) => event,
            None if self.session.endless => ScriptEvent::Frame,
            None => ScriptEvent::Idle,
        }
    }

    fn produce(&mut self) -> Option<DeviceBuffer> {
        let picture = self.next_picture.load(Ordering::SeqCst);
        let (lease, ptr) = self.pool.lease(picture_fill(picture))?;
        self.next_picture.fetch_add(1, Ordering::SeqCst);
        self.sequence += 1;
        Some(DeviceBuffer::new(
            self.geometry,
            ptr,
            self.device_index,
            self.sequence,
            Some(Duration::from_millis(picture * FRAME_INTERVAL_MS)),
            Box::new(lease),
        ))
    }
}

/// Byte every pixel of picture `id` is filled with.
fn picture_fill(id: u64) -> u8 {
    (id % 251) as u8
}

impl DecodeBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn state(&self) -> PipelineState {
        self.state
    }

    fn poll_frame(&mut self) -> FramePoll {
        if self.state != PipelineState::Running {
            return FramePoll::Failed(FailureReason::TransportDropped(
                "pipeline is not running".to_string(),
            ));
        }
        match self.next_event() {
            ScriptEvent::Frame => match self.produce() {
                Some(buffer) => FramePoll::Frame(buffer),
                None => {
                    self.session.events.push_front(ScriptEvent::Frame);
                    FramePoll::NoFrameYet
                }
            },
            ScriptEvent::Idle => FramePoll::NoFrameYet,
            ScriptEvent::End => {
                self.state = PipelineState::Stopped;
                FramePoll::StreamEnded
            }
            ScriptEvent::Fail(reason) => {
                self.state = PipelineState::Faulted;
                FramePoll::Failed(reason)
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = PipelineState::Stopped;
        self.ledger.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        self.close();
    }
}

//! Schedule items and their timing state machine
//!
//! A [`ScheduleItem`] carries the timing of one playlist entry (start time,
//! duration, start mode, prerolls) together with its status and the monitor
//! that turns those deadlines into events:
//!
//! ```text
//! now >= start - preroll_start  → Prepared, StartTimeNear
//! now >= start                  → Playing,  StartTimeReached
//! now >= end - preroll_end      →           EndTimeNear
//! now >= end                    → Played,   EndTimeReached
//! ```
//!
//! Items never reference each other. Adjacency comes from the position of an
//! item inside a [`PlaylistCollection`](crate::collection::PlaylistCollection).

mod subscribers;

pub use subscribers::{ItemHandler, SubscriptionId};

use crate::error::{Error, Result};
use crate::scheduler::{self, ItemScheduler, Phase, RunTicket, Timeline};
use chrono::{DateTime, Utc};
use playout_common::time;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use subscribers::SubscriberRegistry;
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Default lead time for `StartTimeNear` and `EndTimeNear`
pub const DEFAULT_PREROLL: Duration = Duration::from_secs(2);

/// Default upper bound on a single deadline sleep before the wall clock is re-read
pub const DEFAULT_CLOCK_RESYNC: Duration = Duration::from_millis(250);

/// How an item gets its start time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartMode {
    /// Item never runs
    None,
    /// Item starts at an explicitly assigned wall-clock time
    Schedule,
    /// Item starts when its predecessor ends
    #[default]
    AutoFollow,
}

impl fmt::Display for StartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartMode::None => write!(f, "None"),
            StartMode::Schedule => write!(f, "Schedule"),
            StartMode::AutoFollow => write!(f, "AutoFollow"),
        }
    }
}

/// Lifecycle status of an item
///
/// `None → Prepared → Playing → Played`, with `Skipped` reachable from
/// `None`/`Prepared` and `Aborted` from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    None,
    Prepared,
    Playing,
    Played,
    Skipped,
    Aborted,
}

impl Status {
    /// `Played`, `Skipped` and `Aborted` end a lifecycle
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Played | Status::Skipped | Status::Aborted)
    }

    fn rank(self) -> Option<u8> {
        match self {
            Status::None => Some(0),
            Status::Prepared => Some(1),
            Status::Playing => Some(2),
            Status::Played => Some(3),
            Status::Skipped | Status::Aborted => None,
        }
    }

    /// Whether `self → to` is a legal forward transition
    pub fn can_transition_to(self, to: Status) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Status::Skipped => matches!(self, Status::None | Status::Prepared),
            Status::Aborted => true,
            _ => match (self.rank(), to.rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Kinds of item events, used to pick subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StartTimeNear,
    StartTimeReached,
    EndTimeNear,
    EndTimeReached,
    StartModeChanged,
}

/// Event raised by a single item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemEvent {
    StartTimeNear,
    StartTimeReached,
    EndTimeNear,
    EndTimeReached,
    StartModeChanged { old: StartMode, new: StartMode },
}

impl ItemEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ItemEvent::StartTimeNear => EventKind::StartTimeNear,
            ItemEvent::StartTimeReached => EventKind::StartTimeReached,
            ItemEvent::EndTimeNear => EventKind::EndTimeNear,
            ItemEvent::EndTimeReached => EventKind::EndTimeReached,
            ItemEvent::StartModeChanged { .. } => EventKind::StartModeChanged,
        }
    }

    fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::StartNear => ItemEvent::StartTimeNear,
            Phase::Start => ItemEvent::StartTimeReached,
            Phase::EndNear => ItemEvent::EndTimeNear,
            Phase::End => ItemEvent::EndTimeReached,
        }
    }
}

/// Capability set the collection and controller work with
///
/// Payload types embed a [`ScheduleItem`] and expose it here; the core never
/// looks at anything else.
pub trait PlaylistItem: Send + Sync + 'static {
    fn schedule(&self) -> &ScheduleItem;

    /// Human-readable name used in logs
    fn label(&self) -> String {
        self.schedule().id().to_string()
    }
}

impl PlaylistItem for ScheduleItem {
    fn schedule(&self) -> &ScheduleItem {
        self
    }
}

struct ItemState {
    start_time: Option<DateTime<Utc>>,
    duration: Duration,
    start_mode: StartMode,
    status: Status,
    preroll_start: Duration,
    preroll_end: Duration,
    clock_resync: Duration,
    scheduler: ItemScheduler,
    /// Phase deliveries currently calling handlers
    in_delivery: usize,
}

impl ItemState {
    fn end_time(&self) -> Option<DateTime<Utc>> {
        self.start_time.map(|s| time::add_duration(s, self.duration))
    }
}

/// Shared core of an item, also held by its running monitor task
pub(crate) struct ItemCore {
    id: Uuid,
    state: Mutex<ItemState>,
    subscribers: SubscriberRegistry,
    /// Signalled whenever a phase delivery finishes
    delivered: Condvar,
    runtime: Option<Handle>,
}

thread_local! {
    /// Nesting depth of phase deliveries on this thread
    static DELIVERY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as delivering phase events until dropped
struct DeliveryScope;

impl DeliveryScope {
    fn enter() -> Self {
        DELIVERY_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DeliveryScope
    }

    fn active() -> bool {
        DELIVERY_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

type PendingRun = (RunTicket, Timeline);

impl ItemCore {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, ItemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new run if the item is eligible, cancelling any prior one
    fn begin_run(&self, state: &mut ItemState) -> Option<PendingRun> {
        if state.status == Status::Skipped {
            debug!("Item {} is skipped, not scheduling", self.id);
            return None;
        }

        // Prior run is superseded silently, no Aborted
        state.scheduler.cancel();

        let start = match state.start_time {
            Some(start) if !state.duration.is_zero() && state.start_mode != StartMode::None => start,
            _ => {
                debug!(
                    "Item {} not eligible for scheduling (start={:?}, duration={:?}, mode={})",
                    self.id, state.start_time, state.duration, state.start_mode
                );
                return None;
            }
        };

        let ticket = state.scheduler.begin();
        state.status = Status::None;
        let timeline = Timeline::new(
            start,
            state.duration,
            state.preroll_start,
            state.preroll_end,
            state.clock_resync,
        );
        Some((ticket, timeline))
    }

    fn spawn_run(self: &Arc<Self>, pending: PendingRun) -> bool {
        let (ticket, timeline) = pending;
        let handle = Handle::try_current().ok().or_else(|| self.runtime.clone());
        let Some(handle) = handle else {
            warn!("Item {} cannot be scheduled: no tokio runtime available", self.id);
            self.lock().scheduler.finish(&ticket);
            return false;
        };
        handle.spawn(scheduler::run_monitor(Arc::clone(self), ticket, timeline));
        true
    }

    fn start_scheduling(self: &Arc<Self>) -> bool {
        let pending = self.begin_run(&mut self.lock());
        match pending {
            Some(pending) => self.spawn_run(pending),
            None => false,
        }
    }

    /// Restart the active run after a timing change
    ///
    /// With `expected`, only restarts if that run is still the active one.
    fn restart_if_active(self: &Arc<Self>, expected: Option<u64>) {
        let pending = {
            let mut state = self.lock();
            let active = state.scheduler.active_run();
            if active.is_none() || (expected.is_some() && active != expected) {
                return;
            }
            debug!("Item {} timing changed, restarting run", self.id);
            match self.begin_run(&mut state) {
                Some(pending) => Some(pending),
                None => {
                    // No longer eligible: the old run must not keep firing
                    state.scheduler.cancel();
                    None
                }
            }
        };
        if let Some(pending) = pending {
            self.spawn_run(pending);
        }
    }

    fn cancel_scheduling(&self) -> bool {
        let mut state = self.lock();
        if !state.scheduler.cancel() {
            return false;
        }
        state.status = Status::Aborted;
        debug!("Item {} scheduling cancelled", self.id);
        self.await_deliveries(state);
        true
    }

    /// Block until no phase delivery of this item is calling handlers
    ///
    /// Skipped on a thread that is itself delivering phase events: the
    /// caller is a handler, and waiting could close a cycle between items.
    fn await_deliveries(&self, mut state: MutexGuard<'_, ItemState>) {
        if DeliveryScope::active() {
            return;
        }
        while state.in_delivery > 0 {
            state = self.delivered.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Commit a phase of `ticket`'s run and notify subscribers
    ///
    /// The cancellation check and the status change happen under the state
    /// lock. Handlers are called outside it, one at a time, and each call is
    /// preceded by a cancellation check; `cancel_scheduling` waits for the
    /// delivery to drain. A run cancelled before this point never changes
    /// status or emits again.
    pub(crate) fn complete_phase(&self, ticket: &RunTicket, phase: Phase) -> bool {
        {
            let mut state = self.lock();
            if !state.scheduler.is_current(ticket) {
                return false;
            }
            if let Some(status) = phase.status() {
                state.status = status;
            }
            if phase == Phase::End {
                state.scheduler.finish(ticket);
            }
            state.in_delivery += 1;
        }
        debug!("Item {} run {} reached {:?}", self.id, ticket.run, phase);
        self.deliver(ItemEvent::for_phase(phase), ticket);
        self.lock().in_delivery -= 1;
        self.delivered.notify_all();
        true
    }

    fn deliver(&self, event: ItemEvent, ticket: &RunTicket) {
        let _scope = DeliveryScope::enter();
        for handler in self.subscribers.take_for(event.kind(), Some(ticket.run)) {
            if ticket.token.is_cancelled() {
                trace!("Item {} run {} cancelled during {:?}", self.id, ticket.run, event);
                break;
            }
            self.invoke(&handler, &event);
        }
    }

    /// Notify subscribers of an event raised outside a scheduling run
    fn emit(&self, event: ItemEvent) {
        for handler in self.subscribers.take_for(event.kind(), None) {
            self.invoke(&handler, &event);
        }
    }

    fn invoke(&self, handler: &ItemHandler, event: &ItemEvent) {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            error!("Item {} handler panicked on {:?}", self.id, event);
        }
    }
}

/// Timed playlist entry with its own cancellable monitor
///
/// Dropping the item cancels any active run.
pub struct ScheduleItem {
    core: Arc<ItemCore>,
}

impl ScheduleItem {
    /// New item: auto-follow, zero duration, no start time, default prerolls
    pub fn new() -> Self {
        Self {
            core: Arc::new(ItemCore {
                id: Uuid::new_v4(),
                state: Mutex::new(ItemState {
                    start_time: None,
                    duration: Duration::ZERO,
                    start_mode: StartMode::AutoFollow,
                    status: Status::None,
                    preroll_start: DEFAULT_PREROLL,
                    preroll_end: DEFAULT_PREROLL,
                    clock_resync: DEFAULT_CLOCK_RESYNC,
                    scheduler: ItemScheduler::default(),
                    in_delivery: 0,
                }),
                subscribers: SubscriberRegistry::default(),
                delivered: Condvar::new(),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    /// Convenience constructor setting the three timing fields
    pub fn with_timing(start_time: Option<DateTime<Utc>>, duration: Duration, start_mode: StartMode) -> Self {
        let item = Self::new();
        {
            let mut state = item.core.lock();
            state.start_time = start_time;
            state.duration = duration;
            state.start_mode = start_mode;
        }
        item
    }

    /// Identity used in logs
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.core.lock().start_time
    }

    /// Set the start time, restarting an active run
    pub fn set_start_time(&self, start_time: Option<DateTime<Utc>>) {
        {
            let mut state = self.core.lock();
            if state.start_time == start_time {
                return;
            }
            state.start_time = start_time;
        }
        self.core.restart_if_active(None);
    }

    pub fn duration(&self) -> Duration {
        self.core.lock().duration
    }

    /// Set the duration, restarting an active run
    pub fn set_duration(&self, duration: Duration) {
        {
            let mut state = self.core.lock();
            if state.duration == duration {
                return;
            }
            state.duration = duration;
        }
        self.core.restart_if_active(None);
    }

    /// `start_time + duration`, when a start time is set
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.core.lock().end_time()
    }

    pub fn start_mode(&self) -> StartMode {
        self.core.lock().start_mode
    }

    /// Set the start mode
    ///
    /// Subscribers see `StartModeChanged` first; if the run that was active
    /// before the change is still active afterwards, it is restarted.
    pub fn set_start_mode(&self, start_mode: StartMode) {
        let (old, active) = {
            let mut state = self.core.lock();
            if state.start_mode == start_mode {
                return;
            }
            let old = state.start_mode;
            state.start_mode = start_mode;
            (old, state.scheduler.active_run())
        };
        debug!("Item {} start mode {} -> {}", self.core.id, old, start_mode);
        self.core.emit(ItemEvent::StartModeChanged { old, new: start_mode });
        if active.is_some() {
            self.core.restart_if_active(active);
        }
    }

    pub fn status(&self) -> Status {
        self.core.lock().status
    }

    /// Move the status forward
    ///
    /// Fails with `InvalidTransition` for backward moves or moves out of a
    /// terminal status.
    pub fn transition_to(&self, status: Status) -> Result<()> {
        let mut state = self.core.lock();
        if !state.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                from: state.status,
                to: status,
            });
        }
        state.status = status;
        Ok(())
    }

    pub fn preroll_start(&self) -> Duration {
        self.core.lock().preroll_start
    }

    /// Set the lead time of `StartTimeNear`; must be non-zero
    pub fn set_preroll_start(&self, preroll: Duration) -> Result<()> {
        validate_preroll("preroll_start", preroll)?;
        self.update_timing(|state| &mut state.preroll_start, preroll);
        Ok(())
    }

    pub fn preroll_end(&self) -> Duration {
        self.core.lock().preroll_end
    }

    /// Set the lead time of `EndTimeNear`; must be non-zero
    pub fn set_preroll_end(&self, preroll: Duration) -> Result<()> {
        validate_preroll("preroll_end", preroll)?;
        self.update_timing(|state| &mut state.preroll_end, preroll);
        Ok(())
    }

    pub fn clock_resync(&self) -> Duration {
        self.core.lock().clock_resync
    }

    /// Set the longest single sleep of a deadline wait; must be non-zero
    pub fn set_clock_resync(&self, resync: Duration) -> Result<()> {
        if resync.is_zero() {
            return Err(Error::InvalidConfiguration(
                "clock resync interval must be positive".to_string(),
            ));
        }
        self.core.lock().clock_resync = resync;
        Ok(())
    }

    fn update_timing(&self, field: impl FnOnce(&mut ItemState) -> &mut Duration, value: Duration) {
        {
            let mut state = self.core.lock();
            let slot = field(&mut state);
            if *slot == value {
                return;
            }
            *slot = value;
        }
        self.core.restart_if_active(None);
    }

    /// Start monitoring this item's deadlines
    ///
    /// No-op for skipped items. Any prior run is cancelled first. A new run
    /// only starts when a start time is set, the duration is non-zero and the
    /// start mode is not `None`. Returns whether a run was started.
    ///
    /// A started run resets the status to `None`, including from `Playing`,
    /// `Played` and `Aborted`. This is the one way out of those states and
    /// bypasses the forward-only rule of [`transition_to`](Self::transition_to),
    /// so a played or aborted item can be scheduled again. `Skipped` stays
    /// terminal.
    pub fn start_scheduling(&self) -> bool {
        self.core.start_scheduling()
    }

    /// Cancel the active run and mark the item `Aborted`
    ///
    /// No-op (returns `false`) when nothing is being monitored. Once this
    /// returns `true` the cancelled run emits nothing more: a phase delivery
    /// already calling handlers on another thread is waited for. Called from
    /// inside an event handler it does not wait, so it must not be called
    /// while holding a lock that one of this item's handlers takes.
    pub fn cancel_scheduling(&self) -> bool {
        self.core.cancel_scheduling()
    }

    /// Whether a run is currently active
    pub fn is_scheduling(&self) -> bool {
        self.core.lock().scheduler.is_active()
    }

    /// Mark the item `Skipped`, silently cancelling its run
    ///
    /// Only items that never started playing (`None` or `Prepared`) can be
    /// skipped. Returns whether the item was marked.
    pub fn mark_skipped(&self) -> bool {
        let mut state = self.core.lock();
        if !state.status.can_transition_to(Status::Skipped) {
            return false;
        }
        let cancelled = state.scheduler.cancel();
        state.status = Status::Skipped;
        if cancelled {
            self.core.await_deliveries(state);
        }
        true
    }

    /// Attach a handler for every event of `kind`
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ItemEvent) + Send + Sync + 'static,
    {
        self.core.subscribers.add(kind, false, Arc::new(handler))
    }

    /// Attach a handler delivered at most once per scheduling run
    pub fn subscribe_once<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ItemEvent) + Send + Sync + 'static,
    {
        self.core.subscribers.add(kind, true, Arc::new(handler))
    }

    /// Detach a handler; returns whether it was attached
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.subscribers.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.core.subscribers.len()
    }
}

impl Default for ScheduleItem {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScheduleItem {
    fn drop(&mut self) {
        self.core.lock().scheduler.cancel();
    }
}

impl fmt::Debug for ScheduleItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.lock();
        f.debug_struct("ScheduleItem")
            .field("id", &self.core.id)
            .field("start_time", &state.start_time)
            .field("duration", &state.duration)
            .field("start_mode", &state.start_mode)
            .field("status", &state.status)
            .field("scheduling", &state.scheduler.is_active())
            .finish()
    }
}

fn validate_preroll(name: &str, preroll: Duration) -> Result<()> {
    if preroll.is_zero() {
        return Err(Error::InvalidConfiguration(format!(
            "{} must be positive and not zero",
            name
        )));
    }
    Ok(())
}

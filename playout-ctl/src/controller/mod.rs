//! Playlist controller
//!
//! Composes the timing events of every item in a [`PlaylistCollection`] into
//! one playlist narrative:
//!
//! - tracks the currently playing and the prepared (next) item
//! - chains auto-follow items: when an item nears its end, the next item in
//!   collection order gets `start_time = end_time` and starts monitoring
//! - detects items passed over by an out-of-sequence start and reports them in
//!   a single `ElementsSkipped` event
//! - publishes `PlaylistStarted` / `PlaylistStopped`
//!
//! Outward events go through an [`EventBus`]; collection and item callbacks
//! are synchronous so bookkeeping is complete before a mutation returns.
//!
//! Handlers registered on items and on the collection hold weak references to
//! the controller, so items never keep it alive.

mod skip;

use crate::collection::{CollectionChange, ObserverId, PlaylistCollection};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::item::{
    EventKind, ItemEvent, PlaylistItem, ScheduleItem, StartMode, Status, SubscriptionId,
    DEFAULT_CLOCK_RESYNC, DEFAULT_PREROLL,
};
use playout_common::{time, EventBus};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default capacity of the outward event bus
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Timing events the controller consumes once per scheduling run
const TIMING_EVENTS: [EventKind; 4] = [
    EventKind::StartTimeNear,
    EventKind::StartTimeReached,
    EventKind::EndTimeNear,
    EventKind::EndTimeReached,
];

/// Event published by the controller
pub enum PlaylistEvent<T> {
    StartTimeNear(Arc<T>),
    StartTimeReached(Arc<T>),
    EndTimeNear(Arc<T>),
    EndTimeReached(Arc<T>),
    /// An item started while nothing was prepared
    PlaylistStarted,
    /// An item ended while nothing was prepared to follow it
    PlaylistStopped,
    /// Items passed over by an out-of-sequence start, nearest first
    ElementsSkipped(Vec<Arc<T>>),
}

impl<T> PlaylistEvent<T> {
    /// Event name used in logs and JSON output
    pub fn name(&self) -> &'static str {
        match self {
            PlaylistEvent::StartTimeNear(_) => "StartTimeNear",
            PlaylistEvent::StartTimeReached(_) => "StartTimeReached",
            PlaylistEvent::EndTimeNear(_) => "EndTimeNear",
            PlaylistEvent::EndTimeReached(_) => "EndTimeReached",
            PlaylistEvent::PlaylistStarted => "PlaylistStarted",
            PlaylistEvent::PlaylistStopped => "PlaylistStopped",
            PlaylistEvent::ElementsSkipped(_) => "ElementsSkipped",
        }
    }

    /// Items carried by the event
    pub fn items(&self) -> &[Arc<T>] {
        match self {
            PlaylistEvent::StartTimeNear(item)
            | PlaylistEvent::StartTimeReached(item)
            | PlaylistEvent::EndTimeNear(item)
            | PlaylistEvent::EndTimeReached(item) => std::slice::from_ref(item),
            PlaylistEvent::ElementsSkipped(items) => items,
            PlaylistEvent::PlaylistStarted | PlaylistEvent::PlaylistStopped => &[],
        }
    }
}

impl<T> Clone for PlaylistEvent<T> {
    fn clone(&self) -> Self {
        match self {
            PlaylistEvent::StartTimeNear(item) => PlaylistEvent::StartTimeNear(Arc::clone(item)),
            PlaylistEvent::StartTimeReached(item) => PlaylistEvent::StartTimeReached(Arc::clone(item)),
            PlaylistEvent::EndTimeNear(item) => PlaylistEvent::EndTimeNear(Arc::clone(item)),
            PlaylistEvent::EndTimeReached(item) => PlaylistEvent::EndTimeReached(Arc::clone(item)),
            PlaylistEvent::PlaylistStarted => PlaylistEvent::PlaylistStarted,
            PlaylistEvent::PlaylistStopped => PlaylistEvent::PlaylistStopped,
            PlaylistEvent::ElementsSkipped(items) => PlaylistEvent::ElementsSkipped(items.clone()),
        }
    }
}

impl<T: PlaylistItem> fmt::Debug for PlaylistEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self.items().iter().map(|i| i.label()).collect();
        if labels.is_empty() {
            write!(f, "{}", self.name())
        } else {
            write!(f, "{}({})", self.name(), labels.join(", "))
        }
    }
}

/// Handlers attached to one item
struct Attachment<T> {
    item: Weak<T>,
    subscriptions: Vec<SubscriptionId>,
}

/// Current/prepared bookkeeping
struct Tracking<T> {
    current: Option<Weak<T>>,
    prepared: Option<Weak<T>>,
}

impl<T> Tracking<T> {
    /// Drop the current and prepared references to `item`
    fn forget(&mut self, item: &Arc<T>) -> bool {
        let mut forgot = false;
        for slot in [&mut self.current, &mut self.prepared] {
            if slot.as_ref().is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(item))) {
                *slot = None;
                forgot = true;
            }
        }
        forgot
    }
}

impl<T> Default for Tracking<T> {
    fn default() -> Self {
        Self {
            current: None,
            prepared: None,
        }
    }
}

struct ControllerInner<T: PlaylistItem> {
    playlist: Arc<PlaylistCollection<T>>,
    preroll_start: Duration,
    preroll_end: Duration,
    clock_resync: Duration,
    initialized: AtomicBool,
    /// Collection observer registered by `initialize`
    observer: Mutex<Option<ObserverId>>,
    tracking: Mutex<Tracking<T>>,
    attachments: Mutex<HashMap<Uuid, Attachment<T>>>,
    events: EventBus<PlaylistEvent<T>>,
}

/// Drives a playlist from the timing events of its items
///
/// Nothing is observed until [`initialize`](Self::initialize) is called.
pub struct PlaylistController<T: PlaylistItem> {
    inner: Arc<ControllerInner<T>>,
}

impl<T: PlaylistItem> PlaylistController<T> {
    /// Controller with default prerolls (2s) and event capacity
    pub fn new(playlist: Arc<PlaylistCollection<T>>) -> Self {
        Self::build(
            playlist,
            DEFAULT_PREROLL,
            DEFAULT_PREROLL,
            DEFAULT_CLOCK_RESYNC,
            DEFAULT_EVENT_CAPACITY,
        )
    }

    /// Controller applying `preroll` as both start and end preroll
    ///
    /// Fails with `InvalidConfiguration` for a zero preroll.
    pub fn with_preroll(playlist: Arc<PlaylistCollection<T>>, preroll: Duration) -> Result<Self> {
        if preroll.is_zero() {
            return Err(Error::InvalidConfiguration(
                "preroll must be positive and not zero".to_string(),
            ));
        }
        Ok(Self::build(
            playlist,
            preroll,
            preroll,
            DEFAULT_CLOCK_RESYNC,
            DEFAULT_EVENT_CAPACITY,
        ))
    }

    /// Controller configured from a validated [`ControllerConfig`]
    pub fn with_config(playlist: Arc<PlaylistCollection<T>>, config: &ControllerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(
            playlist,
            config.preroll_start(),
            config.preroll_end(),
            config.clock_resync(),
            config.event_capacity,
        ))
    }

    fn build(
        playlist: Arc<PlaylistCollection<T>>,
        preroll_start: Duration,
        preroll_end: Duration,
        clock_resync: Duration,
        event_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                playlist,
                preroll_start,
                preroll_end,
                clock_resync,
                initialized: AtomicBool::new(false),
                observer: Mutex::new(None),
                tracking: Mutex::new(Tracking::default()),
                attachments: Mutex::new(HashMap::new()),
                events: EventBus::new(event_capacity),
            }),
        }
    }

    /// Start observing the playlist
    ///
    /// Attaches handlers to every item, applies the controller's prerolls and
    /// starts every schedule-mode item whose start time is still ahead.
    /// Auto-follow items only start by chaining off their predecessor.
    /// Calling this again is a no-op.
    pub fn initialize(&self) {
        let inner = &self.inner;
        if inner.initialized.swap(true, Ordering::SeqCst) {
            return;
        }

        let controller = Arc::downgrade(inner);
        let observer = inner.playlist.subscribe(move |change| {
            if let Some(controller) = controller.upgrade() {
                controller.on_collection_change(change);
            }
        });
        *inner.observer_slot() = Some(observer);

        let items = inner.playlist.snapshot();
        for item in &items {
            inner.attach(item);
        }
        for item in &items {
            inner.start_if_scheduled(item);
        }

        info!("Playlist controller initialized with {} items", items.len());
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Stop observing the playlist and cancel every monitor
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.initialized.store(false, Ordering::SeqCst);
        if let Some(observer) = inner.observer_slot().take() {
            inner.playlist.unsubscribe(observer);
        }

        for item in inner.playlist.snapshot() {
            item.schedule().cancel_scheduling();
        }
        let attachments = std::mem::take(&mut *inner.attachments());
        for attachment in attachments.into_values() {
            if let Some(item) = attachment.item.upgrade() {
                item.schedule().cancel_scheduling();
                for id in attachment.subscriptions {
                    item.schedule().unsubscribe(id);
                }
            }
        }

        *inner.tracking() = Tracking::default();
        info!("Playlist controller shut down");
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PlaylistEvent<T>> {
        self.inner.events.subscribe()
    }

    pub fn current_playing_item(&self) -> Option<Arc<T>> {
        self.inner.current_playing_item()
    }

    pub fn prepared_item(&self) -> Option<Arc<T>> {
        self.inner.prepared_item()
    }

    pub fn preroll_start(&self) -> Duration {
        self.inner.preroll_start
    }

    pub fn preroll_end(&self) -> Duration {
        self.inner.preroll_end
    }

    pub fn playlist(&self) -> &Arc<PlaylistCollection<T>> {
        &self.inner.playlist
    }
}

impl<T: PlaylistItem> Drop for PlaylistController<T> {
    fn drop(&mut self) {
        // Detach only; monitors keep their own lifecycle
        let inner = &self.inner;
        if let Some(observer) = inner.observer_slot().take() {
            inner.playlist.unsubscribe(observer);
        }
        let attachments = std::mem::take(&mut *inner.attachments());
        for attachment in attachments.into_values() {
            if let Some(item) = attachment.item.upgrade() {
                for id in attachment.subscriptions {
                    item.schedule().unsubscribe(id);
                }
            }
        }
    }
}

impl<T: PlaylistItem> ControllerInner<T> {
    fn observer_slot(&self) -> MutexGuard<'_, Option<ObserverId>> {
        self.observer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tracking(&self) -> MutexGuard<'_, Tracking<T>> {
        self.tracking.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attachments(&self) -> MutexGuard<'_, HashMap<Uuid, Attachment<T>>> {
        self.attachments.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_playing_item(&self) -> Option<Arc<T>> {
        self.tracking().current.as_ref().and_then(Weak::upgrade)
    }

    fn prepared_item(&self) -> Option<Arc<T>> {
        self.tracking().prepared.as_ref().and_then(Weak::upgrade)
    }

    fn emit(&self, event: PlaylistEvent<T>) {
        debug!("Playlist event: {:?}", event);
        self.events.emit_lossy(event);
    }

    // ========================================
    // Attachment
    // ========================================

    /// Attach the controller's handlers to `item` and apply its timing defaults
    ///
    /// An item already attached (for instance a duplicate entry) is left alone.
    fn attach(self: &Arc<Self>, item: &Arc<T>) {
        let schedule = item.schedule();
        let mut attachments = self.attachments();
        if attachments.contains_key(&schedule.id()) {
            return;
        }

        if let Err(e) = self.apply_timing(schedule) {
            warn!("Could not apply controller timing to {}: {}", item.label(), e);
        }

        let mut subscriptions: Vec<SubscriptionId> = TIMING_EVENTS
            .iter()
            .map(|kind| schedule.subscribe_once(*kind, self.item_handler(item)))
            .collect();
        subscriptions.push(schedule.subscribe(EventKind::StartModeChanged, self.item_handler(item)));

        attachments.insert(
            schedule.id(),
            Attachment {
                item: Arc::downgrade(item),
                subscriptions,
            },
        );
        debug!("Attached {}", item.label());
    }

    fn apply_timing(&self, schedule: &ScheduleItem) -> Result<()> {
        schedule.set_preroll_start(self.preroll_start)?;
        schedule.set_preroll_end(self.preroll_end)?;
        schedule.set_clock_resync(self.clock_resync)?;
        Ok(())
    }

    fn item_handler(self: &Arc<Self>, item: &Arc<T>) -> impl Fn(&ItemEvent) + Send + Sync + 'static {
        let controller = Arc::downgrade(self);
        let item = Arc::downgrade(item);
        move |event: &ItemEvent| {
            if let (Some(controller), Some(item)) = (controller.upgrade(), item.upgrade()) {
                controller.on_item_event(item, event);
            }
        }
    }

    fn detach(&self, item: &T) {
        let Some(attachment) = self.attachments().remove(&item.schedule().id()) else {
            return;
        };
        for id in attachment.subscriptions {
            item.schedule().unsubscribe(id);
        }
        debug!("Detached {}", item.label());
    }

    /// Cancel, detach and untrack an item that left the collection
    fn release(&self, item: &Arc<T>) {
        if self.playlist.contains(item) {
            // Another occurrence is still in the playlist
            return;
        }
        // Cancel first: it drains a delivery that could still track the item
        item.schedule().cancel_scheduling();
        if self.tracking().forget(item) {
            debug!("{} left the playlist while tracked", item.label());
        }
        self.detach(item);
    }

    /// Start a schedule-mode item whose start time is still ahead
    fn start_if_scheduled(&self, item: &Arc<T>) {
        if !self.initialized.load(Ordering::SeqCst) {
            return;
        }
        let schedule = item.schedule();
        let in_future = schedule.start_time().is_some_and(|start| start > time::now());
        if schedule.start_mode() == StartMode::Schedule && in_future && schedule.start_scheduling() {
            debug!("Scheduled {} for {:?}", item.label(), schedule.start_time());
        }
    }

    // ========================================
    // Collection changes
    // ========================================

    fn on_collection_change(self: &Arc<Self>, change: &CollectionChange<T>) {
        match change {
            CollectionChange::Added { item, .. } => {
                self.attach(item);
                self.start_if_scheduled(item);
            }
            CollectionChange::Removed { .. } | CollectionChange::RangeRemoved { .. } => {
                for item in change.removed_items() {
                    self.release(item);
                }
            }
            CollectionChange::Cleared { items } => {
                let (current, prepared) = (self.current_playing_item(), self.prepared_item());
                for item in current.iter().chain(prepared.iter()) {
                    item.schedule().cancel_scheduling();
                }
                for item in items {
                    self.release(item);
                }
                *self.tracking() = Tracking::default();
            }
            CollectionChange::Moved { .. } => {}
        }
    }

    // ========================================
    // Item events
    // ========================================

    fn on_item_event(&self, item: Arc<T>, event: &ItemEvent) {
        match *event {
            ItemEvent::StartTimeNear => self.emit(PlaylistEvent::StartTimeNear(item)),
            ItemEvent::StartTimeReached => self.on_start_time_reached(item),
            ItemEvent::EndTimeNear => self.on_end_time_near(item),
            ItemEvent::EndTimeReached => self.on_end_time_reached(item),
            ItemEvent::StartModeChanged { old, new } => self.on_start_mode_changed(&item, old, new),
        }
    }

    fn on_start_time_reached(&self, item: Arc<T>) {
        let (previous, prepared) = {
            let mut tracking = self.tracking();
            let previous = tracking
                .current
                .replace(Arc::downgrade(&item))
                .and_then(|w| w.upgrade());
            (previous, tracking.prepared.as_ref().and_then(Weak::upgrade))
        };

        info!("Now playing {}", item.label());
        self.emit(PlaylistEvent::StartTimeReached(Arc::clone(&item)));
        self.check_for_skips(&item, previous, prepared);

        // Fires whenever nothing was queued, not only on the first start
        if self.prepared_item().is_none() {
            info!("Playlist started");
            self.emit(PlaylistEvent::PlaylistStarted);
        }
    }

    /// Detect items passed over when `current` was not the prepared item
    fn check_for_skips(&self, current: &Arc<T>, previous: Option<Arc<T>>, prepared: Option<Arc<T>>) {
        if prepared.as_ref().is_some_and(|p| Arc::ptr_eq(p, current)) {
            return;
        }

        let items = self.playlist.snapshot();
        if let Some(index) = items.iter().position(|i| Arc::ptr_eq(i, current)) {
            let skipped = skip::mark_skipped_before(&items, index);
            if !skipped.is_empty() {
                let labels: Vec<String> = skipped.iter().map(|i| i.label()).collect();
                info!("Skipped {} items: {}", skipped.len(), labels.join(", "));
                self.emit(PlaylistEvent::ElementsSkipped(skipped));
            }
        }

        for stale in previous.iter().chain(prepared.iter()) {
            if !Arc::ptr_eq(stale, current) && stale.schedule().cancel_scheduling() {
                debug!("Cancelled stale monitor of {}", stale.label());
            }
        }
    }

    /// Chain the next auto-follow item onto the end of `item`
    fn on_end_time_near(&self, item: Arc<T>) {
        let next = self
            .playlist
            .next_after(&item)
            .filter(|next| next.schedule().start_mode() == StartMode::AutoFollow);
        self.tracking().prepared = next.as_ref().map(Arc::downgrade);

        match &next {
            Some(next) => {
                let schedule = next.schedule();
                schedule.set_start_time(item.schedule().end_time());
                if schedule.start_scheduling() {
                    debug!("Prepared {} to follow {}", next.label(), item.label());
                } else {
                    warn!("Could not prepare {} to follow {}", next.label(), item.label());
                }
            }
            None => debug!("Nothing to follow {}", item.label()),
        }

        self.emit(PlaylistEvent::EndTimeNear(item));
    }

    fn on_end_time_reached(&self, item: Arc<T>) {
        debug!("Finished {}", item.label());
        self.emit(PlaylistEvent::EndTimeReached(item));

        if self.prepared_item().is_none() {
            info!("Playlist stopped");
            self.emit(PlaylistEvent::PlaylistStopped);
        }
    }

    fn on_start_mode_changed(&self, item: &Arc<T>, old: StartMode, new: StartMode) {
        let schedule = item.schedule();
        if old == StartMode::Schedule && schedule.status() == Status::None {
            if schedule.cancel_scheduling() {
                debug!("{} left schedule mode, monitor cancelled", item.label());
            }
            return;
        }
        if new == StartMode::Schedule {
            self.start_if_scheduled(item);
        }
    }
}

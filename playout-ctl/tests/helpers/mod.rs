//! Shared helpers for playout-ctl integration tests
//!
//! Timings in these tests are in the tens to hundreds of milliseconds; waits
//! use generous timeouts so a loaded machine only slows tests down.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use playout_common::time;
use playout_ctl::{EventKind, ItemEvent, PlaylistEvent, PlaylistItem, ScheduleItem};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

/// Upper bound for any single expected event
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

pub fn from_now(offset: Duration) -> DateTime<Utc> {
    time::add_duration(time::now(), offset)
}

pub fn ago(offset: Duration) -> DateTime<Utc> {
    time::sub_duration(time::now(), offset)
}

/// Records an item's timing events with the wall-clock time they arrived
pub struct ItemRecorder {
    rx: mpsc::UnboundedReceiver<(ItemEvent, DateTime<Utc>)>,
}

impl ItemRecorder {
    /// Subscribe to the four timing events of `item`
    pub fn attach(item: &ScheduleItem) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in [
            EventKind::StartTimeNear,
            EventKind::StartTimeReached,
            EventKind::EndTimeNear,
            EventKind::EndTimeReached,
        ] {
            let tx = tx.clone();
            item.subscribe(kind, move |event| {
                let _ = tx.send((*event, time::now()));
            });
        }
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<(ItemEvent, DateTime<Utc>)> {
        timeout(EVENT_TIMEOUT, self.rx.recv()).await.ok().flatten()
    }

    /// Next `count` events, stopping early on timeout
    pub async fn take(&mut self, count: usize) -> Vec<ItemEvent> {
        let mut events = Vec::with_capacity(count);
        while events.len() < count {
            match self.next().await {
                Some((event, _)) => events.push(event),
                None => break,
            }
        }
        events
    }

    /// True if nothing arrives within `window`
    pub async fn is_silent_for(&mut self, window: Duration) -> bool {
        matches!(timeout(window, self.rx.recv()).await, Err(_) | Ok(None))
    }
}

/// Next controller event, or `None` on timeout or closed bus
pub async fn next_event<T>(rx: &mut broadcast::Receiver<PlaylistEvent<T>>) -> Option<PlaylistEvent<T>> {
    timeout(EVENT_TIMEOUT, rx.recv()).await.ok()?.ok()
}

/// Skip events until one matches `predicate`
pub async fn wait_for<T, F>(rx: &mut broadcast::Receiver<PlaylistEvent<T>>, predicate: F) -> Option<PlaylistEvent<T>>
where
    F: Fn(&PlaylistEvent<T>) -> bool,
{
    loop {
        let event = next_event(rx).await?;
        if predicate(&event) {
            return Some(event);
        }
    }
}

/// Collect events up to and including the first `PlaylistStopped`
pub async fn collect_until_stopped<T>(rx: &mut broadcast::Receiver<PlaylistEvent<T>>) -> Vec<PlaylistEvent<T>> {
    let mut events = Vec::new();
    while let Some(event) = next_event(rx).await {
        let stopped = matches!(event, PlaylistEvent::PlaylistStopped);
        events.push(event);
        if stopped {
            break;
        }
    }
    events
}

/// `"Name(label)"` strings for the events that concern `label`
pub fn names_for<T: PlaylistItem>(events: &[PlaylistEvent<T>], label: &str) -> Vec<&'static str> {
    events
        .iter()
        .filter(|e| e.items().iter().any(|i| i.label() == label))
        .map(|e| e.name())
        .collect()
}

pub fn count_named<T>(events: &[PlaylistEvent<T>], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}

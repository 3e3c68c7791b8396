//! Per-item deadline monitor
//!
//! Each scheduling run of an item is one tokio task that walks the four
//! timing phases in order. Tasks are multiplexed onto the tokio runtime and
//! its timer wheel, so pending monitors cost a timer entry each rather than
//! an OS thread.
//!
//! A phase waits on a single deadline sleep raced against the run's
//! cancellation token. Long waits are cut into slices of at most the item's
//! clock resync interval so that wall-clock adjustments are picked up.

use crate::item::{ItemCore, Status};
use chrono::{DateTime, Utc};
use playout_common::time;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// The four sequential phases of a scheduling run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    StartNear,
    Start,
    EndNear,
    End,
}

impl Phase {
    pub(crate) const ALL: [Phase; 4] = [Phase::StartNear, Phase::Start, Phase::EndNear, Phase::End];

    /// Status the item enters when this phase completes
    pub(crate) fn status(self) -> Option<Status> {
        match self {
            Phase::StartNear => Some(Status::Prepared),
            Phase::Start => Some(Status::Playing),
            Phase::EndNear => None,
            Phase::End => Some(Status::Played),
        }
    }
}

/// Deadlines of one run, fixed when the run begins
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timeline {
    pub(crate) start_near: DateTime<Utc>,
    pub(crate) start: DateTime<Utc>,
    pub(crate) end_near: DateTime<Utc>,
    pub(crate) end: DateTime<Utc>,
    pub(crate) resync: Duration,
}

impl Timeline {
    pub(crate) fn new(
        start: DateTime<Utc>,
        duration: Duration,
        preroll_start: Duration,
        preroll_end: Duration,
        resync: Duration,
    ) -> Self {
        let end = time::add_duration(start, duration);
        Self {
            start_near: time::sub_duration(start, preroll_start),
            start,
            end_near: time::sub_duration(end, preroll_end),
            end,
            resync,
        }
    }

    pub(crate) fn deadline(&self, phase: Phase) -> DateTime<Utc> {
        match phase {
            Phase::StartNear => self.start_near,
            Phase::Start => self.start,
            Phase::EndNear => self.end_near,
            Phase::End => self.end,
        }
    }
}

/// Ticket identifying one scheduling run
#[derive(Debug, Clone)]
pub(crate) struct RunTicket {
    pub(crate) run: u64,
    pub(crate) token: CancellationToken,
}

/// Bookkeeping for the item's active run, guarded by the item's state lock
#[derive(Debug, Default)]
pub(crate) struct ItemScheduler {
    active: Option<RunTicket>,
    runs_started: u64,
}

impl ItemScheduler {
    pub(crate) fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub(crate) fn active_run(&self) -> Option<u64> {
        self.active.as_ref().map(|t| t.run)
    }

    /// True while `ticket` is still the live, uncancelled run
    pub(crate) fn is_current(&self, ticket: &RunTicket) -> bool {
        !ticket.token.is_cancelled() && self.active_run() == Some(ticket.run)
    }

    /// Cancel any prior run and open a new one
    pub(crate) fn begin(&mut self) -> RunTicket {
        self.cancel();
        self.runs_started += 1;
        let ticket = RunTicket {
            run: self.runs_started,
            token: CancellationToken::new(),
        };
        self.active = Some(ticket.clone());
        ticket
    }

    /// Cancel the active run, returning whether there was one
    pub(crate) fn cancel(&mut self) -> bool {
        match self.active.take() {
            Some(ticket) => {
                ticket.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Close `ticket`'s run after its last phase, leaving newer runs alone
    pub(crate) fn finish(&mut self, ticket: &RunTicket) {
        if self.active_run() == Some(ticket.run) {
            self.active = None;
        }
    }
}

/// Drive one scheduling run to completion or cancellation
pub(crate) async fn run_monitor(core: Arc<ItemCore>, ticket: RunTicket, timeline: Timeline) {
    debug!(
        "Item {} run {} monitoring: start={} end={}",
        core.id(),
        ticket.run,
        timeline.start,
        timeline.end
    );

    for phase in Phase::ALL {
        if !wait_until(timeline.deadline(phase), &ticket.token, timeline.resync).await {
            trace!("Item {} run {} cancelled before {:?}", core.id(), ticket.run, phase);
            return;
        }
        if !core.complete_phase(&ticket, phase) {
            trace!("Item {} run {} superseded at {:?}", core.id(), ticket.run, phase);
            return;
        }
    }
}

/// Wait until the wall clock reaches `deadline`
///
/// Returns `false` if the token was cancelled first. A deadline already in
/// the past returns immediately without sleeping.
pub(crate) async fn wait_until(
    deadline: DateTime<Utc>,
    token: &CancellationToken,
    resync: Duration,
) -> bool {
    loop {
        if token.is_cancelled() {
            return false;
        }
        let Some(remaining) = time::remaining_until(deadline, time::now()) else {
            return true;
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(remaining.min(resync)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_timeline_deadlines() {
        let start = time::now();
        let timeline = Timeline::new(
            start,
            Duration::from_secs(10),
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_millis(250),
        );

        assert_eq!(timeline.deadline(Phase::StartNear), time::sub_duration(start, Duration::from_secs(2)));
        assert_eq!(timeline.deadline(Phase::Start), start);
        assert_eq!(timeline.deadline(Phase::EndNear), time::add_duration(start, Duration::from_secs(7)));
        assert_eq!(timeline.deadline(Phase::End), time::add_duration(start, Duration::from_secs(10)));
    }

    #[test]
    fn test_phase_order_and_statuses() {
        let statuses: Vec<_> = Phase::ALL.iter().map(|p| p.status()).collect();
        assert_eq!(
            statuses,
            vec![Some(Status::Prepared), Some(Status::Playing), None, Some(Status::Played)]
        );
    }

    #[test]
    fn test_scheduler_begin_cancels_prior_run() {
        let mut scheduler = ItemScheduler::default();
        let first = scheduler.begin();
        let second = scheduler.begin();

        assert!(first.token.is_cancelled());
        assert!(!scheduler.is_current(&first));
        assert!(scheduler.is_current(&second));
        assert_eq!(second.run, first.run + 1);
    }

    #[test]
    fn test_scheduler_finish_ignores_stale_ticket() {
        let mut scheduler = ItemScheduler::default();
        let first = scheduler.begin();
        let second = scheduler.begin();

        scheduler.finish(&first);
        assert_eq!(scheduler.active_run(), Some(second.run));

        scheduler.finish(&second);
        assert!(!scheduler.is_active());
        assert!(!scheduler.cancel());
    }

    #[tokio::test]
    async fn test_wait_until_past_deadline_returns_immediately() {
        let token = CancellationToken::new();
        let started = Instant::now();
        let past = time::sub_duration(time::now(), Duration::from_secs(5));

        assert!(wait_until(past, &token, Duration::from_millis(250)).await);
        assert!(started.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_wait_until_reaches_deadline() {
        let token = CancellationToken::new();
        let deadline = time::add_duration(time::now(), Duration::from_millis(60));

        assert!(wait_until(deadline, &token, Duration::from_millis(10)).await);
        assert!(time::now() >= deadline);
    }

    #[tokio::test]
    async fn test_wait_until_observes_cancellation() {
        let token = CancellationToken::new();
        let deadline = time::add_duration(time::now(), Duration::from_secs(30));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        assert!(!wait_until(deadline, &token, Duration::from_secs(1)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

//! Skip detection
//!
//! When playback lands on an item out of sequence, every earlier item that
//! never got to play is marked `Skipped`. The walk goes backward from the new
//! current item and stops at the first item that already played.

use crate::item::{PlaylistItem, Status};
use std::sync::Arc;

/// Mark the unplayed items before `index` as skipped
///
/// Returns the newly skipped items in the order visited (nearest first).
/// Items that are playing or already terminal are passed over unchanged.
pub(super) fn mark_skipped_before<T: PlaylistItem>(items: &[Arc<T>], index: usize) -> Vec<Arc<T>> {
    let mut skipped = Vec::new();
    let end = index.min(items.len());

    for item in items[..end].iter().rev() {
        let schedule = item.schedule();
        match schedule.status() {
            Status::Played => break,
            Status::None | Status::Prepared => {
                if schedule.mark_skipped() {
                    skipped.push(Arc::clone(item));
                }
            }
            Status::Playing | Status::Skipped | Status::Aborted => {}
        }
    }

    skipped
}

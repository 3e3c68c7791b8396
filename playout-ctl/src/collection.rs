//! Ordered, observable playlist
//!
//! The collection is the arena for playlist items: an item's position is its
//! only link to its neighbours. Every structural mutation notifies observers
//! synchronously, after the change is applied and before the mutating call
//! returns.
//!
//! Items are compared by identity (`Arc` pointer), so the same item may appear
//! more than once.

use crate::error::{Error, Result};
use crate::item::PlaylistItem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

/// Structural change applied to a collection
#[derive(Debug)]
pub enum CollectionChange<T> {
    /// One item inserted at `index`
    Added { index: usize, item: Arc<T> },
    /// One item removed from `index`
    Removed { index: usize, item: Arc<T> },
    /// Several items removed in one operation, in their former order
    RangeRemoved { items: Vec<Arc<T>> },
    /// One item moved from `from` to `to`
    Moved { from: usize, to: usize, item: Arc<T> },
    /// Every item removed; carries what the collection held
    Cleared { items: Vec<Arc<T>> },
}

impl<T> CollectionChange<T> {
    /// Items that left the collection with this change
    pub fn removed_items(&self) -> &[Arc<T>] {
        match self {
            CollectionChange::Removed { item, .. } => std::slice::from_ref(item),
            CollectionChange::RangeRemoved { items } | CollectionChange::Cleared { items } => items,
            CollectionChange::Added { .. } | CollectionChange::Moved { .. } => &[],
        }
    }
}

/// Handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer<T> = Arc<dyn Fn(&CollectionChange<T>) + Send + Sync>;

/// Ordered sequence of playlist items with change notifications
///
/// Structural changes are serialized: one writer applies its change and
/// notifies observers before the next writer starts. Observers must not
/// mutate the collection from inside the callback.
pub struct PlaylistCollection<T> {
    items: RwLock<Vec<Arc<T>>>,
    observers: RwLock<Vec<(ObserverId, Observer<T>)>>,
    next_observer: AtomicU64,
    writer: Mutex<()>,
}

impl<T: PlaylistItem> PlaylistCollection<T> {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::from_items(Vec::new())
    }

    /// Create a collection holding `items` in order, without notifications
    pub fn from_items(items: impl IntoIterator<Item = Arc<T>>) -> Self {
        Self {
            items: RwLock::new(items.into_iter().collect()),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<T>>> {
        self.items.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<T>>> {
        self.items.write().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_mutation(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================
    // Observation
    // ========================================

    /// Register an observer for structural changes
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&CollectionChange<T>) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer; returns whether it was registered
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    fn notify(&self, change: CollectionChange<T>) {
        let observers: Vec<Observer<T>> = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&change))).is_err() {
                error!("Playlist observer panicked while handling {:?}", ChangeName(&change));
            }
        }
    }

    // ========================================
    // Queries
    // ========================================

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        self.read().get(index).cloned()
    }

    /// Copy of the current sequence
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.read().clone()
    }

    /// Position of the first occurrence of `item` (by identity)
    pub fn index_of(&self, item: &T) -> Option<usize> {
        self.read().iter().position(|i| std::ptr::eq(Arc::as_ptr(i), item))
    }

    pub fn contains(&self, item: &T) -> bool {
        self.index_of(item).is_some()
    }

    /// Item directly after the first occurrence of `item`
    pub fn next_after(&self, item: &T) -> Option<Arc<T>> {
        let items = self.read();
        let index = items.iter().position(|i| std::ptr::eq(Arc::as_ptr(i), item))?;
        items.get(index + 1).cloned()
    }

    // ========================================
    // Insertion
    // ========================================

    /// Append an item
    pub fn add(&self, item: Arc<T>) {
        let _writer = self.begin_mutation();
        let index = {
            let mut items = self.write();
            items.push(Arc::clone(&item));
            items.len() - 1
        };
        debug!("Added {} at {}", item.label(), index);
        self.notify(CollectionChange::Added { index, item });
    }

    /// Insert an item at `index` (`index == len` appends)
    pub fn insert(&self, index: usize, item: Arc<T>) -> Result<()> {
        let _writer = self.begin_mutation();
        {
            let mut items = self.write();
            if index > items.len() {
                return Err(Error::OutOfRange { index, len: items.len() });
            }
            items.insert(index, Arc::clone(&item));
        }
        debug!("Inserted {} at {}", item.label(), index);
        self.notify(CollectionChange::Added { index, item });
        Ok(())
    }

    /// Append several items, notifying once per item in insertion order
    pub fn add_range(&self, new_items: impl IntoIterator<Item = Arc<T>>) {
        let _writer = self.begin_mutation();
        let added: Vec<(usize, Arc<T>)> = {
            let mut items = self.write();
            new_items
                .into_iter()
                .map(|item| {
                    items.push(Arc::clone(&item));
                    (items.len() - 1, item)
                })
                .collect()
        };
        for (index, item) in added {
            self.notify(CollectionChange::Added { index, item });
        }
    }

    /// Insert several items starting at `index`, preserving their order
    pub fn insert_range(&self, index: usize, new_items: impl IntoIterator<Item = Arc<T>>) -> Result<()> {
        let _writer = self.begin_mutation();
        let added: Vec<(usize, Arc<T>)> = {
            let mut items = self.write();
            if index > items.len() {
                return Err(Error::OutOfRange { index, len: items.len() });
            }
            let new_items: Vec<Arc<T>> = new_items.into_iter().collect();
            items.splice(index..index, new_items.iter().cloned());
            new_items
                .into_iter()
                .enumerate()
                .map(|(offset, item)| (index + offset, item))
                .collect()
        };
        for (index, item) in added {
            self.notify(CollectionChange::Added { index, item });
        }
        Ok(())
    }

    // ========================================
    // Removal
    // ========================================

    /// Remove the first occurrence of `item`; returns whether it was present
    pub fn remove(&self, item: &T) -> bool {
        let _writer = self.begin_mutation();
        let removed = {
            let mut items = self.write();
            items
                .iter()
                .position(|i| std::ptr::eq(Arc::as_ptr(i), item))
                .map(|index| (index, items.remove(index)))
        };
        match removed {
            Some((index, item)) => {
                debug!("Removed {} from {}", item.label(), index);
                self.notify(CollectionChange::Removed { index, item });
                true
            }
            None => false,
        }
    }

    /// Remove and return the item at `index`
    pub fn remove_at(&self, index: usize) -> Result<Arc<T>> {
        let _writer = self.begin_mutation();
        let item = {
            let mut items = self.write();
            if index >= items.len() {
                return Err(Error::OutOfRange { index, len: items.len() });
            }
            items.remove(index)
        };
        debug!("Removed {} from {}", item.label(), index);
        self.notify(CollectionChange::Removed {
            index,
            item: Arc::clone(&item),
        });
        Ok(item)
    }

    /// Remove `count` items starting at `index`
    pub fn remove_range(&self, index: usize, count: usize) -> Result<Vec<Arc<T>>> {
        let _writer = self.begin_mutation();
        let removed: Vec<Arc<T>> = {
            let mut items = self.write();
            let len = items.len();
            let end = index.checked_add(count).filter(|end| *end <= len);
            let Some(end) = end else {
                return Err(Error::OutOfRange { index, len });
            };
            items.drain(index..end).collect()
        };
        if !removed.is_empty() {
            debug!("Removed {} items from {}", removed.len(), index);
            self.notify(CollectionChange::RangeRemoved {
                items: removed.clone(),
            });
        }
        Ok(removed)
    }

    /// Remove every item matching `predicate`, returning them in former order
    pub fn remove_where<F>(&self, mut predicate: F) -> Vec<Arc<T>>
    where
        F: FnMut(&T) -> bool,
    {
        let _writer = self.begin_mutation();
        let removed: Vec<Arc<T>> = {
            let mut items = self.write();
            let mut removed = Vec::new();
            items.retain(|item| {
                if predicate(item) {
                    removed.push(Arc::clone(item));
                    false
                } else {
                    true
                }
            });
            removed
        };
        if !removed.is_empty() {
            debug!("Removed {} matching items", removed.len());
            self.notify(CollectionChange::RangeRemoved {
                items: removed.clone(),
            });
        }
        removed
    }

    /// Remove every item
    pub fn clear(&self) {
        let _writer = self.begin_mutation();
        let items = std::mem::take(&mut *self.write());
        debug!("Cleared {} items", items.len());
        self.notify(CollectionChange::Cleared { items });
    }

    // ========================================
    // Reordering
    // ========================================

    /// Move the item at `from` so that it ends up at `to`
    pub fn move_item(&self, from: usize, to: usize) -> Result<()> {
        let _writer = self.begin_mutation();
        let item = {
            let mut items = self.write();
            let len = items.len();
            if from >= len {
                return Err(Error::OutOfRange { index: from, len });
            }
            if to >= len {
                return Err(Error::OutOfRange { index: to, len });
            }
            let item = items.remove(from);
            items.insert(to, Arc::clone(&item));
            item
        };
        if from != to {
            self.notify(CollectionChange::Moved { from, to, item });
        }
        Ok(())
    }

    /// Replace the item at `index`, returning the old one
    ///
    /// Observers see the removal of the old item, then the addition of the new one.
    pub fn replace(&self, index: usize, item: Arc<T>) -> Result<Arc<T>> {
        let _writer = self.begin_mutation();
        let old = {
            let mut items = self.write();
            let len = items.len();
            let slot = items.get_mut(index).ok_or(Error::OutOfRange { index, len })?;
            std::mem::replace(slot, Arc::clone(&item))
        };
        self.notify(CollectionChange::Removed {
            index,
            item: Arc::clone(&old),
        });
        self.notify(CollectionChange::Added { index, item });
        Ok(old)
    }
}

impl<T: PlaylistItem> Default for PlaylistCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Compact description of a change for log lines
struct ChangeName<'a, T>(&'a CollectionChange<T>);

impl<T> std::fmt::Debug for ChangeName<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            CollectionChange::Added { index, .. } => write!(f, "Added@{}", index),
            CollectionChange::Removed { index, .. } => write!(f, "Removed@{}", index),
            CollectionChange::RangeRemoved { items } => write!(f, "RangeRemoved({})", items.len()),
            CollectionChange::Moved { from, to, .. } => write!(f, "Moved({}->{})", from, to),
            CollectionChange::Cleared { items } => write!(f, "Cleared({})", items.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ScheduleItem;

    fn items(n: usize) -> Vec<Arc<ScheduleItem>> {
        (0..n).map(|_| Arc::new(ScheduleItem::new())).collect()
    }

    fn recording(collection: &PlaylistCollection<ScheduleItem>) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        collection.subscribe(move |change| {
            sink.lock().unwrap().push(format!("{:?}", ChangeName(change)));
        });
        log
    }

    #[test]
    fn test_from_items_preserves_order_without_notifications() {
        let initial = items(3);
        let collection = PlaylistCollection::from_items(initial.clone());
        let log = recording(&collection);

        assert_eq!(collection.len(), 3);
        for (i, item) in initial.iter().enumerate() {
            assert_eq!(collection.index_of(item), Some(i));
        }
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_insert_shifts_following_items() {
        let initial = items(2);
        let collection = PlaylistCollection::from_items(initial.clone());
        let inserted = Arc::new(ScheduleItem::new());

        collection.insert(1, Arc::clone(&inserted)).unwrap();
        assert_eq!(collection.index_of(&inserted), Some(1));
        assert_eq!(collection.index_of(&initial[1]), Some(2));
        assert!(Arc::ptr_eq(&collection.next_after(&initial[0]).unwrap(), &inserted));
    }

    #[test]
    fn test_index_operations_are_bounds_checked() {
        let collection = PlaylistCollection::from_items(items(2));
        let log = recording(&collection);

        assert!(matches!(
            collection.insert(3, Arc::new(ScheduleItem::new())),
            Err(Error::OutOfRange { index: 3, len: 2 })
        ));
        assert!(matches!(collection.remove_at(2), Err(Error::OutOfRange { .. })));
        assert!(matches!(collection.remove_range(1, 2), Err(Error::OutOfRange { .. })));
        assert!(matches!(collection.remove_range(usize::MAX, 2), Err(Error::OutOfRange { .. })));
        assert!(matches!(collection.move_item(0, 2), Err(Error::OutOfRange { .. })));
        assert!(matches!(
            collection.replace(5, Arc::new(ScheduleItem::new())),
            Err(Error::OutOfRange { .. })
        ));

        assert_eq!(collection.len(), 2);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicates_by_identity() {
        let item = Arc::new(ScheduleItem::new());
        let collection = PlaylistCollection::new();
        collection.add(Arc::clone(&item));
        collection.add(Arc::clone(&item));

        assert_eq!(collection.len(), 2);
        assert_eq!(collection.index_of(&item), Some(0));
        assert!(collection.remove(&item));
        assert!(collection.contains(&item));
        assert!(collection.remove(&item));
        assert!(!collection.remove(&item));
    }

    #[test]
    fn test_move_item() {
        let initial = items(3);
        let collection = PlaylistCollection::from_items(initial.clone());
        let log = recording(&collection);

        collection.move_item(0, 2).unwrap();
        assert_eq!(collection.index_of(&initial[0]), Some(2));
        assert_eq!(collection.index_of(&initial[1]), Some(0));

        collection.move_item(1, 1).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["Moved(0->2)".to_string()]);
    }

    #[test]
    fn test_replace_notifies_removed_then_added() {
        let initial = items(2);
        let collection = PlaylistCollection::from_items(initial.clone());
        let log = recording(&collection);
        let replacement = Arc::new(ScheduleItem::new());

        let old = collection.replace(1, Arc::clone(&replacement)).unwrap();
        assert!(Arc::ptr_eq(&old, &initial[1]));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["Removed@1".to_string(), "Added@1".to_string()]
        );
    }

    #[test]
    fn test_remove_where_reports_matches_in_order() {
        let initial = items(5);
        let collection = PlaylistCollection::from_items(initial.clone());
        let odd: Vec<_> = vec![Arc::clone(&initial[1]), Arc::clone(&initial[3])];

        let removed = collection.remove_where(|item| odd.iter().any(|o| std::ptr::eq(Arc::as_ptr(o), item)));
        assert_eq!(removed.len(), 2);
        assert!(Arc::ptr_eq(&removed[0], &initial[1]));
        assert!(Arc::ptr_eq(&removed[1], &initial[3]));
        assert_eq!(collection.len(), 3);

        // Nothing matches: no notification
        let log = recording(&collection);
        assert!(collection.remove_where(|_| false).is_empty());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let collection = PlaylistCollection::new();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let id = collection.subscribe(move |_| *sink.lock().unwrap() += 1);

        collection.add(Arc::new(ScheduleItem::new()));
        assert!(collection.unsubscribe(id));
        collection.add(Arc::new(ScheduleItem::new()));

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(!collection.unsubscribe(id));
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let collection = PlaylistCollection::new();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        collection.subscribe(|_| panic!("observer failure"));
        collection.subscribe(move |_| *sink.lock().unwrap() += 1);

        collection.add(Arc::new(ScheduleItem::new()));
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(collection.len(), 1);
    }
}

//! Reusable allocators for connection and stream state.
//!
//! - [`Arena`]: slab storage addressed by generation-checked [`Key`]s, so an
//!   event carrying the key of a freed slot is detected instead of landing on
//!   whatever reused the slot.
//! - [`ObjectPool`]: a bounded, thread-safe free list of recyclable objects.
//!   Objects are handed out as [`Pooled`] guards and return to the pool
//!   exactly once, when the guard drops.

use slab::Slab;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to an [`Arena`] slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Entry<T> {
    generation: u32,
    value: T,
}

/// Capacity-bounded slab with generation-checked keys.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct Arena<T> {
    slots: Slab<Entry<T>>,
    next_generation: u32,
    capacity: usize,
}

impl<T> Arena<T> {
    /// Create an arena holding at most `capacity` values.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity.min(u32::MAX as usize)),
            next_generation: 0,
            capacity: capacity.min(u32::MAX as usize),
        }
    }

    /// Insert a value.
    ///
    /// Returns `None` if the arena is at capacity.
    pub fn insert(&mut self, value: T) -> Option<Key> {
        if self.slots.len() >= self.capacity {
            return None;
        }
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.slots.insert(Entry { generation, value });
        Some(Key {
            index: index as u32,
            generation,
        })
    }

    pub fn get(&self, key: Key) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|entry| entry.generation == key.generation)
            .map(|entry| &entry.value)
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|entry| entry.generation == key.generation)
            .map(|entry| &mut entry.value)
    }

    /// Remove the value for `key`. Stale keys remove nothing.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        if !self.contains(key) {
            return None;
        }
        Some(self.slots.remove(key.index as usize).value)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keys of all occupied slots.
    pub fn keys(&self) -> Vec<Key> {
        self.slots
            .iter()
            .map(|(index, entry)| Key {
                index: index as u32,
                generation: entry.generation,
            })
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Key, &mut T)> {
        self.slots.iter_mut().map(|(index, entry)| {
            (
                Key {
                    index: index as u32,
                    generation: entry.generation,
                },
                &mut entry.value,
            )
        })
    }
}

/// Objects that can be reset for reuse.
///
/// `recycle` must return the object to its freshly-constructed state while
/// keeping any allocations worth reusing.
pub trait Recycle {
    fn recycle(&mut self);
}

/// Bounded pool of recyclable objects shared across threads.
pub struct ObjectPool<T> {
    free: Mutex<Vec<T>>,
    live: AtomicUsize,
    capacity: usize,
}

impl<T: Recycle + Default> ObjectPool<T> {
    /// Create a pool that hands out at most `capacity` objects at once.
    ///
    /// Objects are constructed lazily and kept for reuse after release.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Take an object from the pool.
    ///
    /// Returns `None` if `capacity` objects are already outstanding.
    pub fn acquire(self: &Arc<Self>) -> Option<Pooled<T>> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.capacity).then_some(live + 1)
            })
            .ok()?;

        let value = lock(&self.free).pop().unwrap_or_default();
        Some(Pooled {
            value,
            pool: Arc::clone(self),
        })
    }

    fn release(&self, mut value: T) {
        value.recycle();
        lock(&self.free).push(value);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of objects currently handed out.
    pub fn in_use(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// An object on loan from an [`ObjectPool`].
///
/// Dropping the guard recycles the object and returns it to the pool.
pub struct Pooled<T: Recycle + Default> {
    value: T,
    pool: Arc<ObjectPool<T>>,
}

impl<T: Recycle + Default> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Recycle + Default> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Recycle + Default> Drop for Pooled<T> {
    fn drop(&mut self) {
        let value = std::mem::take(&mut self.value);
        self.pool.release(value);
    }
}

impl<T: Recycle + Default + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_capacity() {
        let mut arena = Arena::new(2);

        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();
        assert!(arena.insert("c").is_none());

        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));

        arena.remove(a);
        assert!(!arena.contains(a));
        assert_eq!(arena.len(), 1);
        assert!(arena.insert("c").is_some());
    }

    #[test]
    fn test_arena_stale_key() {
        let mut arena = Arena::new(4);

        let old = arena.insert(1).unwrap();
        arena.remove(old);
        let new = arena.insert(2).unwrap();

        // Slab reuses the slot, the generation tells them apart.
        assert_eq!(old.index, new.index);
        assert_ne!(old, new);
        assert!(arena.get(old).is_none());
        assert!(arena.get_mut(old).is_none());
        assert!(arena.remove(old).is_none());
        assert_eq!(arena.get(new), Some(&2));
    }

    #[test]
    fn test_arena_keys() {
        let mut arena = Arena::new(4);
        let a = arena.insert('a').unwrap();
        let b = arena.insert('b').unwrap();

        let keys = arena.keys();
        assert_eq!(keys, vec![a, b]);

        for (_, value) in arena.iter_mut() {
            *value = value.to_ascii_uppercase();
        }
        assert_eq!(arena.get(b), Some(&'B'));
    }

    #[derive(Debug, Default)]
    struct Scratch {
        data: Vec<u8>,
        uses: usize,
    }

    impl Recycle for Scratch {
        fn recycle(&mut self) {
            self.data.clear();
        }
    }

    #[test]
    fn test_object_pool_bounded() {
        let pool: Arc<ObjectPool<Scratch>> = ObjectPool::new(2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert!(pool.acquire().is_none());

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.acquire().is_some());

        drop(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_object_pool_recycles() {
        let pool: Arc<ObjectPool<Scratch>> = ObjectPool::new(1);

        {
            let mut item = pool.acquire().unwrap();
            item.data.extend_from_slice(b"request");
            item.uses += 1;
        }

        let item = pool.acquire().unwrap();
        assert!(item.data.is_empty());
        // Capacity survives recycling; `uses` is untouched by `recycle`.
        assert!(item.data.capacity() >= 7);
        assert_eq!(item.uses, 1);
    }

    #[test]
    fn test_object_pool_threads() {
        let pool: Arc<ObjectPool<Scratch>> = ObjectPool::new(8);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut item = pool.acquire().unwrap();
                        item.data.push(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }
}

//! Copy-on-publish atomic pointer table.
//!
//! Lock-free readers index the table in O(1); a single writer (holding its
//! own creation mutex) grows it by allocating a larger array, copying the
//! pointers, then publishing root before size with release ordering. Readers
//! load size with acquire, so a relaxed root load afterwards still observes
//! the matching array. Old arrays are retired, not freed, until drop:
//! a reader that loaded the old root may still be dereferencing it.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct PublishedTable<T> {
    root: AtomicPtr<AtomicPtr<T>>,
    size: AtomicUsize,
    /// Length of the allocation behind `root`; only mutated by the writer.
    alloc_cap: AtomicUsize,
    retired: Mutex<Vec<(*mut AtomicPtr<T>, usize)>>,
}

unsafe impl<T> Send for PublishedTable<T> {}
unsafe impl<T> Sync for PublishedTable<T> {}

fn alloc_array<T>(cap: usize) -> *mut AtomicPtr<T> {
    let mut v: Vec<AtomicPtr<T>> = Vec::with_capacity(cap);
    for _ in 0..cap {
        v.push(AtomicPtr::new(std::ptr::null_mut()));
    }
    Box::into_raw(v.into_boxed_slice()) as *mut AtomicPtr<T>
}

unsafe fn free_array<T>(ptr: *mut AtomicPtr<T>, cap: usize) {
    if !ptr.is_null() {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, cap)));
    }
}

impl<T> PublishedTable<T> {
    pub fn new(initial_capacity: usize) -> Self {
        let cap = initial_capacity.max(1);
        let root = alloc_array::<T>(cap);
        let t = Self {
            root: AtomicPtr::new(root),
            size: AtomicUsize::new(0),
            alloc_cap: AtomicUsize::new(cap),
            retired: Mutex::new(Vec::new()),
        };
        // Publish root before size so readers never see size > array length.
        t.size.store(cap, Ordering::Release);
        t
    }

    pub fn capacity(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Lock-free O(1) lookup. Returns the published pointer or None.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<*mut T> {
        let size = self.size.load(Ordering::Acquire);
        if idx >= size {
            return None;
        }
        // The acquire on size synchronizes with the writer's release stores
        // (root first, then size), so a relaxed root load is sufficient.
        let root = self.root.load(Ordering::Relaxed);
        if root.is_null() {
            return None;
        }
        let slot = unsafe { &*root.add(idx) };
        let ptr = slot.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }

    /// Grow so `idx < capacity`. Caller must hold its creation mutex; this
    /// is not safe to call from two writers at once.
    pub fn ensure_capacity(&self, min_capacity: usize) {
        let current = self.size.load(Ordering::Relaxed);
        if min_capacity <= current {
            return;
        }
        let new_cap = (current * 2).max(min_capacity + 32);

        let new_root = alloc_array::<T>(new_cap);
        let old_root = self.root.load(Ordering::Relaxed);
        if !old_root.is_null() {
            for i in 0..current {
                let p = unsafe { (*old_root.add(i)).load(Ordering::Relaxed) };
                unsafe { (*new_root.add(i)).store(p, Ordering::Relaxed) };
            }
        }

        self.root.store(new_root, Ordering::Release);
        self.size.store(new_cap, Ordering::Release);
        let old_cap = self.alloc_cap.swap(new_cap, Ordering::Relaxed);

        // Retire, never free: lock-free readers may still hold the old root.
        if !old_root.is_null() {
            self.retired.lock().unwrap().push((old_root, old_cap));
        }
    }

    /// Publish `ptr` at `idx`. Caller must hold its creation mutex and have
    /// ensured capacity.
    pub fn publish(&self, idx: usize, ptr: *mut T) {
        let size = self.size.load(Ordering::Relaxed);
        assert!(idx < size, "publish past table capacity");
        let root = self.root.load(Ordering::Relaxed);
        unsafe { (*root.add(idx)).store(ptr, Ordering::Release) };
    }

    /// Unpublish everything so concurrent readers fail fast. Used on close.
    pub fn clear(&self) {
        self.size.store(0, Ordering::Release);
        let old = self.root.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            let cap = self.alloc_cap.swap(0, Ordering::Relaxed);
            self.retired.lock().unwrap().push((old, cap));
        }
    }
}

impl<T> Drop for PublishedTable<T> {
    fn drop(&mut self) {
        let root = self.root.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let cap = self.alloc_cap.load(Ordering::Relaxed);
        unsafe { free_array(root, cap) };
        for (ptr, cap) in self.retired.lock().unwrap().drain(..) {
            unsafe { free_array(ptr, cap) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_get() {
        let table: PublishedTable<u64> = PublishedTable::new(4);
        let mut a = Box::new(7u64);
        let pa: *mut u64 = &mut *a;

        assert!(table.get(0).is_none());
        table.publish(0, pa);
        assert_eq!(table.get(0), Some(pa));
        assert!(table.get(1).is_none());
        assert!(table.get(100).is_none());
    }

    #[test]
    fn grow_preserves_entries() {
        let table: PublishedTable<u64> = PublishedTable::new(2);
        let mut vals: Vec<Box<u64>> = (0..100u64).map(Box::new).collect();
        for (i, v) in vals.iter_mut().enumerate() {
            table.ensure_capacity(i + 1);
            table.publish(i, &mut **v);
        }
        for (i, v) in vals.iter_mut().enumerate() {
            let got = table.get(i).unwrap();
            assert_eq!(got, &mut **v as *mut u64);
            assert_eq!(unsafe { *got }, i as u64);
        }
    }

    #[test]
    fn clear_fails_readers_fast() {
        let table: PublishedTable<u64> = PublishedTable::new(4);
        let mut a = Box::new(1u64);
        table.publish(2, &mut *a);
        table.clear();
        assert!(table.get(2).is_none());
    }
}

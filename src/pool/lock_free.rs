use crate::sync::LockFreeStack;

/// An unchecked pool of boxed objects backed by a [`LockFreeStack`].
///
/// The most recently recycled box is handed out first. Objects are returned
/// as they were; resetting them is up to the caller.
pub struct LockFreePool<T> {
    free: LockFreeStack<Box<T>>,
}

impl<T: Default> LockFreePool<T> {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            free: LockFreeStack::new(),
        }
    }

    /// Takes the most recently recycled box, or allocates a default one.
    pub fn create(&self) -> Box<T> {
        self.free.pop().unwrap_or_default()
    }

    /// Keeps `object` for a later [`LockFreePool::create`].
    ///
    /// # Arguments
    /// * `object` - A box to reuse; its contents are left untouched
    pub fn recycle(&self, object: Box<T>) {
        self.free.push(object);
    }

    /// Approximate number of boxes waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.size()
    }
}

impl<T: Default> Default for LockFreePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_most_recent_box() {
        let pool: LockFreePool<u64> = LockFreePool::new();
        let mut a = pool.create();
        *a = 5;
        let addr = &*a as *const u64;

        pool.recycle(a);
        assert_eq!(pool.idle(), 1);

        let b = pool.create();
        assert_eq!(&*b as *const u64, addr);
        assert_eq!(*b, 5);
        assert_eq!(pool.idle(), 0);
    }
}

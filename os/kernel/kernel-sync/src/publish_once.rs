use core::{
    cell::UnsafeCell,
    fmt,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const PUBLISHED: u8 = 2;

/// A value that is published exactly once and read without locking afterwards.
///
/// Unlike a lazily initialized cell, a second [`set`](Self::set) is refused and
/// hands the rejected value back, so callers can tell "already decided" apart
/// from "decided now".
pub struct PublishOnce<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for PublishOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PublishOnce<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// The published value, if any.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == PUBLISHED {
            // SAFETY: PUBLISHED is only stored after the write completed.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_published(&self) -> bool {
        self.state.load(Ordering::Acquire) == PUBLISHED
    }

    /// Publish `value`.
    ///
    /// # Errors
    /// Returns `value` back if another value was (or is being) published.
    pub fn set(&self, value: T) -> Result<&T, T> {
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            return Err(value);
        }

        // SAFETY: the WRITING state makes us the only writer.
        let published = unsafe { (*self.value.get()).write(value) };
        self.state.store(PUBLISHED, Ordering::Release);
        Ok(published)
    }

    /// Wait for a concurrent [`set`](Self::set) to finish, if one is running.
    pub fn wait(&self) -> Option<&T> {
        loop {
            match self.state.load(Ordering::Acquire) {
                EMPTY => return None,
                WRITING => spin_loop(),
                _ => return self.get(),
            }
        }
    }
}

impl<T> Drop for PublishOnce<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == PUBLISHED {
            // SAFETY: published values are initialized and dropped only here.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PublishOnce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(v) => f.debug_tuple("PublishOnce").field(v).finish(),
            None => f.write_str("PublishOnce(<empty>)"),
        }
    }
}

// Safety: shared after PUBLISHED; publication is single-writer.
unsafe impl<T: Sync + Send> Sync for PublishOnce<T> {}
unsafe impl<T: Send> Send for PublishOnce<T> {}

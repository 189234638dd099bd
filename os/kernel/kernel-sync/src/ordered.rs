//! # Ordered Locks
//!
//! Compile-time enforcement of a lock hierarchy.
//!
//! Every [`OrderedLock`] belongs to a [`LockLevel`]. Acquiring it requires a
//! [`LockContext`] for the level the caller currently sits at, and the type
//! system only permits the call if the lock's level implements
//! [`LockAfter`] for that outer level. The acquisition hands back a new context
//! for the inner level while mutably borrowing the outer one, so the outer
//! context cannot be used to take a second lock at the same depth until the
//! inner guard is gone.
//!
//! ```rust
//! use kernel_sync::{LockContext, OrderedLock, lock_order};
//!
//! pub enum Outer {}
//! pub enum Inner {}
//! lock_order!(Outer => Inner);
//!
//! let outer = OrderedLock::<Outer, _>::new(1_u32);
//! let inner = OrderedLock::<Inner, _>::new(2_u32);
//!
//! let mut root = LockContext::new();
//! let (a, mut ctx) = outer.lock(&mut root);
//! let (b, _) = inner.lock(&mut ctx);
//! assert_eq!(*a + *b, 3);
//! ```
//!
//! Taking `Outer` while holding `Inner` does not compile:
//!
//! ```rust,compile_fail
//! use kernel_sync::{LockContext, OrderedLock, lock_order};
//!
//! pub enum Outer {}
//! pub enum Inner {}
//! lock_order!(Outer => Inner);
//!
//! let outer = OrderedLock::<Outer, _>::new(1_u32);
//! let inner = OrderedLock::<Inner, _>::new(2_u32);
//!
//! let mut root = LockContext::new();
//! let (_b, mut ctx) = inner.lock(&mut root);
//! let (_a, _) = outer.lock(&mut ctx);
//! ```

use crate::spin_lock::{SpinLock, SpinLockGuard};
use core::marker::PhantomData;

/// A position in a lock hierarchy.
pub trait LockLevel {}

/// `Self` may be acquired while a lock of level `Outer` is the innermost one held.
pub trait LockAfter<Outer>: LockLevel {}

/// The level of a context that holds no ordered locks.
pub enum Unlocked {}

impl LockLevel for Unlocked {}

/// Proof that the innermost held ordered lock is of level `L`.
pub struct LockContext<'a, L> {
    _level: PhantomData<fn() -> L>,
    _scope: PhantomData<&'a mut ()>,
}

impl LockContext<'static, Unlocked> {
    /// Context for a top-level entry point that holds no ordered locks.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _level: PhantomData,
            _scope: PhantomData,
        }
    }
}

impl Default for LockContext<'static, Unlocked> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`SpinLock`] pinned to level `L` of a hierarchy.
pub struct OrderedLock<L, T> {
    inner: SpinLock<T>,
    _level: PhantomData<fn() -> L>,
}

impl<L: LockLevel, T> OrderedLock<L, T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
            _level: PhantomData,
        }
    }

    /// Spin until acquired. Returns the guard and the context for level `L`.
    #[inline]
    pub fn lock<'a, Outer>(
        &'a self,
        _outer: &'a mut LockContext<'_, Outer>,
    ) -> (SpinLockGuard<'a, T>, LockContext<'a, L>)
    where
        L: LockAfter<Outer>,
    {
        let guard = self.inner.lock();
        (
            guard,
            LockContext {
                _level: PhantomData,
                _scope: PhantomData,
            },
        )
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Declare a lock hierarchy from outermost to innermost.
///
/// `lock_order!(A => B => C)` makes each level a [`LockLevel`], allows each to
/// be taken from an [`Unlocked`] context, and allows every level to be taken
/// while any level to its left is the innermost one held.
#[macro_export]
macro_rules! lock_order {
    (@after $outer:ty;) => {};
    (@after $outer:ty; $($inner:ty),+) => {
        $(impl $crate::LockAfter<$outer> for $inner {})+
    };
    ($level:ty) => {
        impl $crate::LockLevel for $level {}
        impl $crate::LockAfter<$crate::Unlocked> for $level {}
    };
    ($level:ty => $($rest:ty)=>+) => {
        $crate::lock_order!($level);
        $crate::lock_order!(@after $level; $($rest),+);
        $crate::lock_order!($($rest)=>+);
    };
}

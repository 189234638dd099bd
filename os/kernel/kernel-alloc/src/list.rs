//! # Intrusive Doubly Linked Lists
//!
//! Slabs, bufctls and cache records live in raw slab memory and are chained
//! through a [`Link`] embedded in the record itself. [`List`] owns nothing; it
//! only threads pointers through records whose storage is managed elsewhere.
//!
//! ## Invariants
//!
//! - A node is a member of at most one list at a time.
//! - A node's link fields are both `None` while it is not in any list.
//! - While a node is linked, its storage is neither moved nor reused.
//! - `len` equals the number of nodes reachable from `head` via `next`, and
//!   `tail` is the last of them.
//!
//! The first two are checked with `debug_assert!`; the others are the
//! caller's obligation, which is why the mutating operations are `unsafe`.

use core::marker::PhantomData;
use core::ptr::NonNull;

/// Embedded list pointers.
pub struct Link<T> {
    prev: Option<NonNull<T>>,
    next: Option<NonNull<T>>,
}

impl<T> Link<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prev: None,
            next: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_unlinked(&self) -> bool {
        self.prev.is_none() && self.next.is_none()
    }
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A record type that embeds a [`Link`] to itself.
///
/// # Safety
/// [`link`](Linked::link) must return a pointer to a `Link<Self>` stored
/// inside `*node`, and the same one on every call.
pub unsafe trait Linked: Sized {
    /// Project `node` to its embedded link.
    ///
    /// # Safety
    /// `node` must point to a live `Self`.
    unsafe fn link(node: NonNull<Self>) -> NonNull<Link<Self>>;
}

/// Intrusive list of `T` records.
pub struct List<T: Linked> {
    head: Option<NonNull<T>>,
    tail: Option<NonNull<T>>,
    len: usize,
}

impl<T: Linked> List<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn front(&self) -> Option<NonNull<T>> {
        self.head
    }

    /// # Safety
    /// `node` must be live, unlinked, and stay in place while linked.
    pub unsafe fn push_front(&mut self, node: NonNull<T>) {
        unsafe {
            let link = T::link(node).as_mut();
            debug_assert!(link.is_unlinked(), "node already linked");
            link.prev = None;
            link.next = self.head;
            match self.head {
                Some(old) => T::link(old).as_mut().prev = Some(node),
                None => self.tail = Some(node),
            }
        }
        self.head = Some(node);
        self.len += 1;
    }

    /// # Safety
    /// `node` must be live, unlinked, and stay in place while linked.
    pub unsafe fn push_back(&mut self, node: NonNull<T>) {
        unsafe {
            let link = T::link(node).as_mut();
            debug_assert!(link.is_unlinked(), "node already linked");
            link.next = None;
            link.prev = self.tail;
            match self.tail {
                Some(old) => T::link(old).as_mut().next = Some(node),
                None => self.head = Some(node),
            }
        }
        self.tail = Some(node);
        self.len += 1;
    }

    /// Unlink `node` from this list.
    ///
    /// # Safety
    /// `node` must currently be a member of *this* list.
    pub unsafe fn remove(&mut self, node: NonNull<T>) {
        unsafe {
            let link = T::link(node).as_mut();
            match link.prev {
                Some(prev) => T::link(prev).as_mut().next = link.next,
                None => {
                    debug_assert_eq!(self.head, Some(node), "node not in this list");
                    self.head = link.next;
                }
            }
            match link.next {
                Some(next) => T::link(next).as_mut().prev = link.prev,
                None => {
                    debug_assert_eq!(self.tail, Some(node), "node not in this list");
                    self.tail = link.prev;
                }
            }
            link.prev = None;
            link.next = None;
        }
        self.len -= 1;
    }

    /// Unlink and return the first node.
    pub fn pop_front(&mut self) -> Option<NonNull<T>> {
        let node = self.head?;
        // SAFETY: `head` is a member of this list by the list invariants.
        unsafe { self.remove(node) };
        Some(node)
    }

    /// Successor of `node`, wrapping around to the head after the tail.
    ///
    /// # Safety
    /// `node` must currently be a member of this list.
    #[must_use]
    pub unsafe fn next_wrapping(&self, node: NonNull<T>) -> Option<NonNull<T>> {
        unsafe { T::link(node).as_ref().next }.or(self.head)
    }

    /// `true` if `node` is reachable from the head. Linear.
    #[must_use]
    pub fn contains(&self, node: NonNull<T>) -> bool {
        self.iter().any(|n| n == node)
    }

    /// Iterate the node pointers front to back.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head,
            _list: PhantomData,
        }
    }
}

impl<T: Linked> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`List::iter`].
pub struct Iter<'a, T: Linked> {
    next: Option<NonNull<T>>,
    _list: PhantomData<&'a List<T>>,
}

impl<T: Linked> Iterator for Iter<'_, T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        // SAFETY: linked nodes are live by the list invariants.
        self.next = unsafe { T::link(node).as_ref().next };
        Some(node)
    }
}

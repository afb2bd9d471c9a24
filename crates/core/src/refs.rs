//! Reference ownership discipline
//!
//! Host objects are manually reference counted. Every handle that points at
//! one is tagged with who is responsible for its count:
//!
//! - [`Borrowed`]: a non-owning view. Zero cost (one pointer), `Copy`, and
//!   bound by a lifetime to the scope it was taken from, so the borrow
//!   checker refuses to let it outlive its source.
//! - [`Owned`]: owns exactly one reference. Dropping it releases the
//!   reference; [`Owned::disown`] hands the raw reference to someone else
//!   without touching the count.
//! - [`OutParam`]: a write-once slot a callee fills with an owned reference.
//!   Whatever the slot still holds when it is dropped is released.
//!
//! ## Switch boundaries
//!
//! Any call that can run arbitrary code may destroy objects the caller only
//! borrowed. Every greenlet switch is such a call: the switching frame goes
//! dormant and other greenlets run before it resumes. Values that must
//! survive a switch are therefore held as [`Owned`], never as [`Borrowed`].

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

/// A type whose lifetime is governed by a manual reference count.
///
/// # Safety
/// Implementors must keep the object alive while the count is non-zero, and
/// `decref` must release the object (or hand it to a deferred release path)
/// exactly when the count reaches zero.
pub unsafe trait RefCounted {
    /// Add one reference.
    fn incref(&self);

    /// Drop one reference, releasing the object if it was the last one.
    ///
    /// # Safety
    /// `ptr` must point to a live object and the caller must own the
    /// reference being given up.
    unsafe fn decref(ptr: NonNull<Self>);

    /// Current number of references (a snapshot; other threads may race).
    fn refcount(&self) -> usize;
}

/// An owned reference: exactly one count belongs to this handle.
pub struct Owned<T: RefCounted> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

// Safety: an Owned only hands out shared references, and the count itself
// is maintained by the RefCounted implementation.
unsafe impl<T: RefCounted + Send + Sync> Send for Owned<T> {}
unsafe impl<T: RefCounted + Send + Sync> Sync for Owned<T> {}

impl<T: RefCounted> Owned<T> {
    /// Take ownership of a reference the caller already holds.
    ///
    /// # Safety
    /// `ptr` must point to a live object and the caller must transfer one
    /// reference it owns; the count is not incremented.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Owned {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Create a new owned reference from a borrowed one (increments).
    pub fn new_ref(borrowed: Borrowed<'_, T>) -> Self {
        borrowed.incref();
        Owned {
            ptr: borrowed.ptr,
            _marker: PhantomData,
        }
    }

    /// Give up ownership without releasing the reference.
    ///
    /// The caller becomes responsible for the count (usually by passing the
    /// pointer to [`Owned::from_raw`] later).
    pub fn disown(self) -> NonNull<T> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    /// Non-owning view tied to this handle's lifetime.
    pub fn borrow(&self) -> Borrowed<'_, T> {
        Borrowed {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }

    /// Raw pointer (the count is unchanged).
    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }

    /// Identity comparison.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }
}

impl<T: RefCounted> Clone for Owned<T> {
    fn clone(&self) -> Self {
        Owned::new_ref(self.borrow())
    }
}

impl<T: RefCounted> Drop for Owned<T> {
    fn drop(&mut self) {
        unsafe { T::decref(self.ptr) }
    }
}

impl<T: RefCounted> Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefCounted + fmt::Debug> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// A non-owning view of a reference-counted object.
///
/// Costs exactly one pointer. The lifetime ties it to whatever keeps the
/// object alive (usually an [`Owned`] in an enclosing scope).
pub struct Borrowed<'a, T: RefCounted> {
    ptr: NonNull<T>,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: RefCounted> Borrowed<'a, T> {
    /// Borrow an object through a plain reference.
    pub fn from_ref(value: &'a T) -> Self {
        Borrowed {
            ptr: NonNull::from(value),
            _marker: PhantomData,
        }
    }

    /// Borrow from a raw pointer.
    ///
    /// # Safety
    /// The object must stay alive for `'a`.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Borrowed {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Promote to an owned reference (increments).
    pub fn to_owned_ref(self) -> Owned<T> {
        Owned::new_ref(self)
    }

    pub fn as_ptr(self) -> NonNull<T> {
        self.ptr
    }

    /// The referenced object with the full borrow lifetime.
    pub fn get(self) -> &'a T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefCounted> Clone for Borrowed<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: RefCounted> Copy for Borrowed<'_, T> {}

impl<T: RefCounted> Deref for Borrowed<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefCounted> PartialEq for Borrowed<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: RefCounted> Eq for Borrowed<'_, T> {}

impl<T: RefCounted + fmt::Debug> fmt::Debug for Borrowed<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, T: RefCounted> From<&'a Owned<T>> for Borrowed<'a, T> {
    fn from(owned: &'a Owned<T>) -> Self {
        owned.borrow()
    }
}

/// Result of an operation that hands back a new reference.
///
/// `Ok` carries exactly one owned count; `Err` carries none.
pub type ApiResult<T, E> = Result<Owned<T>, E>;

/// A write-once slot that receives an owned reference from a callee.
///
/// The slot starts empty. A callee fills it once; the caller then takes the
/// value out, disowns it, or lets the slot release it on drop.
pub struct OutParam<T: RefCounted> {
    slot: Option<NonNull<T>>,
}

impl<T: RefCounted> OutParam<T> {
    pub fn new() -> Self {
        OutParam { slot: None }
    }

    /// Store an owned reference. Fails (returning the value) if the slot was
    /// already written.
    pub fn fill(&mut self, value: Owned<T>) -> Result<(), Owned<T>> {
        if self.slot.is_some() {
            return Err(value);
        }
        self.slot = Some(value.disown());
        Ok(())
    }

    pub fn is_filled(&self) -> bool {
        self.slot.is_some()
    }

    /// Move the stored reference out as an [`Owned`] handle.
    pub fn take(&mut self) -> Option<Owned<T>> {
        self.slot.take().map(|ptr| unsafe { Owned::from_raw(ptr) })
    }

    /// Move the stored reference out as a raw pointer; the caller now owns
    /// the count.
    pub fn disown(&mut self) -> Option<NonNull<T>> {
        self.slot.take()
    }

    /// Raw slot for callees that write a pointer directly.
    ///
    /// # Safety
    /// Anything written must be `None` or a pointer carrying one owned
    /// reference, and the slot must be empty before the write.
    pub unsafe fn as_mut_ptr(&mut self) -> *mut Option<NonNull<T>> {
        &mut self.slot
    }
}

impl<T: RefCounted> Default for OutParam<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RefCounted> Drop for OutParam<T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.slot.take() {
            unsafe { T::decref(ptr) }
        }
    }
}

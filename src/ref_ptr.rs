use crate::context::RefContext;
use crate::observer::ObjectId;
use crate::observer_ptr::ObserverPtr;
use crate::referenced::RefHeader;
use core::any::TypeId;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::mem;
use core::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

/// A counted allocation: the header first, then the value.
///
/// `repr(C)` pins the header at offset zero so a header pointer can be
/// cast back to the whole allocation.
#[repr(C)]
pub struct RefCounted<T> {
    header: RefHeader,
    value: T,
}

impl<T> RefCounted<T> {
    pub fn header(&self) -> &RefHeader {
        &self.header
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T> Deref for RefCounted<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

unsafe fn drop_counted<T>(header: NonNull<RefHeader>) {
    // SAFETY: `header` is the first field of a `RefCounted<T>` that came
    // from `Box::into_raw`, with provenance over the whole box.
    drop(unsafe { Box::from_raw(header.cast::<RefCounted<T>>().as_ptr()) });
}

/// Owning handle. Cloning acquires, dropping releases.
pub struct RefPtr<T: Send + Sync + 'static> {
    ptr: NonNull<RefCounted<T>>,
    _owns: PhantomData<RefCounted<T>>,
}

// SAFETY: the count is atomic and `T` is `Send + Sync`, like `Arc<T>`.
unsafe impl<T: Send + Sync + 'static> Send for RefPtr<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for RefPtr<T> {}

impl<T: Send + Sync + 'static> RefPtr<T> {
    /// Allocate in the process-wide context.
    pub fn new(value: T) -> Self {
        Self::allocate(value, None)
    }

    /// Allocate in `context`. The object refers to it weakly; once the
    /// context is gone the object is destroyed in place when released.
    pub fn new_in(value: T, context: &Arc<RefContext>) -> Self {
        Self::allocate(value, Some(context))
    }

    fn allocate(value: T, context: Option<&Arc<RefContext>>) -> Self {
        let boxed = Box::new(RefCounted {
            header: RefHeader::new(context, TypeId::of::<T>(), drop_counted::<T>),
            value,
        });
        // SAFETY: `Box::into_raw` is never null.
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) };
        // SAFETY: fresh, unshared allocation.
        unsafe { RefHeader::bind(ptr.cast()) };
        let this = Self {
            ptr,
            _owns: PhantomData,
        };
        this.header().acquire();
        this
    }

    #[inline]
    fn inner(&self) -> &RefCounted<T> {
        // SAFETY: we own a count, so the allocation is live.
        unsafe { self.ptr.as_ref() }
    }

    pub fn as_counted(&self) -> &RefCounted<T> {
        self.inner()
    }

    pub fn header(&self) -> &RefHeader {
        &self.inner().header
    }

    pub fn id(&self) -> ObjectId {
        self.header().id()
    }

    pub fn count(&self) -> usize {
        self.header().count()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    pub fn downgrade(&self) -> ObserverPtr<T> {
        ObserverPtr::new(self)
    }

    /// Give up the handle without releasing its count.
    pub fn into_raw(this: Self) -> NonNull<RefCounted<T>> {
        let ptr = this.ptr;
        mem::forget(this);
        ptr
    }

    /// Adopt one count previously leaked with `into_raw`.
    ///
    /// # Safety
    /// `ptr` must come from `into_raw` (or an equivalent count-carrying
    /// path) and its count must not be adopted twice.
    pub unsafe fn from_raw(ptr: NonNull<RefCounted<T>>) -> Self {
        Self {
            ptr,
            _owns: PhantomData,
        }
    }

    /// Take a new count on a live object reached through a raw pointer.
    ///
    /// # Safety
    /// `ptr` must point to a live object, including one whose count is zero
    /// after `release_no_delete`.
    pub unsafe fn acquire_raw(ptr: NonNull<RefCounted<T>>) -> Self {
        unsafe { ptr.as_ref() }.header.acquire();
        Self {
            ptr,
            _owns: PhantomData,
        }
    }

    /// Release this handle's count without destroying the object.
    ///
    /// The returned pointer stays valid until someone destroys the object:
    /// `RefHeader::delete_now`, or a later `acquire_raw` whose handle is
    /// dropped.
    pub fn release_no_delete(this: Self) -> NonNull<RefCounted<T>> {
        let ptr = Self::into_raw(this);
        // SAFETY: the count we just leaked keeps the object alive for this call.
        unsafe { ptr.as_ref() }.header.release_no_delete();
        ptr
    }

    pub fn into_any(this: Self) -> AnyRef {
        let ptr = Self::into_raw(this);
        // SAFETY: the leaked count moves into the AnyRef.
        unsafe { AnyRef::from_raw(ptr.cast()) }
    }

    pub(crate) fn as_non_null(&self) -> NonNull<RefCounted<T>> {
        self.ptr
    }
}

impl<T: Send + Sync + 'static> Clone for RefPtr<T> {
    fn clone(&self) -> Self {
        self.header().acquire();
        Self {
            ptr: self.ptr,
            _owns: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Drop for RefPtr<T> {
    fn drop(&mut self) {
        // SAFETY: this handle owns one count and is never used again.
        unsafe { RefHeader::release(self.ptr.cast()) }
    }
}

impl<T: Send + Sync + 'static> Deref for RefPtr<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner().value
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for RefPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefPtr")
            .field("id", &self.id())
            .field("count", &self.count())
            .field("value", &self.inner().value)
            .finish()
    }
}

// Identity semantics: two handles are equal iff they own the same object.
impl<T: Send + Sync + 'static> PartialEq for RefPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T: Send + Sync + 'static> Eq for RefPtr<T> {}

impl<T: Send + Sync + 'static> Hash for RefPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

/// Type-erased owning handle, as produced by `RefHeader::rescue`.
pub struct AnyRef {
    header: NonNull<RefHeader>,
}

// SAFETY: only `Send + Sync` values are ever counted.
unsafe impl Send for AnyRef {}
unsafe impl Sync for AnyRef {}

impl AnyRef {
    /// # Safety
    /// `header` must be live, carry full-allocation provenance, and the
    /// caller must hand over one count.
    pub(crate) unsafe fn from_raw(header: NonNull<RefHeader>) -> Self {
        Self { header }
    }

    pub fn header(&self) -> &RefHeader {
        // SAFETY: we own a count.
        unsafe { self.header.as_ref() }
    }

    pub fn id(&self) -> ObjectId {
        self.header().id()
    }

    pub fn count(&self) -> usize {
        self.header().count()
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.header().value_type_id() == TypeId::of::<T>()
    }

    /// Recover the typed handle, or get `self` back on a type mismatch.
    pub fn downcast<T: Send + Sync + 'static>(self) -> Result<RefPtr<T>, AnyRef> {
        if !self.is::<T>() {
            return Err(self);
        }
        let header = self.header;
        mem::forget(self);
        // SAFETY: the type matches and the count moves into the RefPtr.
        Ok(unsafe { RefPtr::from_raw(header.cast()) })
    }
}

impl Clone for AnyRef {
    fn clone(&self) -> Self {
        self.header().acquire();
        Self {
            header: self.header,
        }
    }
}

impl Drop for AnyRef {
    fn drop(&mut self) {
        // SAFETY: this handle owns one count and is never used again.
        unsafe { RefHeader::release(self.header) }
    }
}

impl fmt::Debug for AnyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyRef")
            .field("id", &self.id())
            .field("count", &self.count())
            .finish()
    }
}

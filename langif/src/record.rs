use std::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::{Mutex, MutexGuard};

use crate::{EmaBuffer, FieldRef, ForeignData, FreeFn, LangifError, Result};

/// Opaque payload type, meaning is agreed upon between boxes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct TypeTag(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// runtime allocates and frees
    Ema,
    /// memory comes from outside
    Lma,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub size: usize,
    pub type_tag: TypeTag,
    pub real_size: usize,
}

/// Pointer to the logical payload of a live value.
/// Valid until the reference it came from is released or resized.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PayloadView {
    ptr: NonNull<u8>,
    len: usize,
}

pub(crate) enum Ownership {
    Wrapped,
    Captured(FreeFn),
}

pub(crate) enum Payload {
    Ema(EmaBuffer),
    Lma {
        data: ForeignData,
        ownership: Ownership,
    },
}

pub(crate) struct Body {
    pub size: usize,
    pub payload: Payload,
}

pub(crate) struct ValueRecord {
    pub type_tag: TypeTag,
    pub strategy: Strategy,
    refcount: AtomicUsize,
    pub body: Mutex<Body>,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Ema => f.write_str("EMA"),
            Strategy::Lma => f.write_str("LMA"),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

impl PayloadView {
    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// the reference must stay live and unresized for `'a`
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        // SAFETY: by contract
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    /// the reference must stay live and unresized for `'a`, and no other
    /// view may be used meanwhile
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [u8] {
        // SAFETY: by contract
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Payload {
    pub fn strategy(&self) -> Strategy {
        match self {
            Payload::Ema(_) => Strategy::Ema,
            Payload::Lma { .. } => Strategy::Lma,
        }
    }

    fn base(&self) -> NonNull<u8> {
        match self {
            Payload::Ema(buffer) => buffer.as_nonnull(),
            Payload::Lma { data, .. } => data.as_nonnull(),
        }
    }

    fn real_size(&self) -> usize {
        match self {
            Payload::Ema(buffer) => buffer.capacity(),
            Payload::Lma { data, .. } => data.len(),
        }
    }
}

impl Body {
    pub fn ema(size: usize, buffer: EmaBuffer) -> Self {
        debug_assert!(size <= buffer.capacity());
        Self {
            size,
            payload: Payload::Ema(buffer),
        }
    }

    pub fn lma(data: ForeignData, ownership: Ownership) -> Self {
        Self {
            size: data.len(),
            payload: Payload::Lma { data, ownership },
        }
    }

    /// what a destroyed record is left holding
    pub fn empty() -> Self {
        Self::ema(0, EmaBuffer::empty())
    }

    pub fn real_size(&self) -> usize {
        self.payload.real_size()
    }

    pub fn view(&self) -> PayloadView {
        PayloadView {
            ptr: self.payload.base(),
            len: self.size,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the payload is at least `size` bytes and we hold the body exclusively
        unsafe { std::slice::from_raw_parts_mut(self.payload.base().as_ptr(), self.size) }
    }
}

impl ValueRecord {
    pub fn new(type_tag: TypeTag, body: Body) -> Self {
        Self {
            type_tag,
            strategy: body.payload.strategy(),
            refcount: AtomicUsize::new(1),
            body: Mutex::new(body),
        }
    }

    #[inline]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increment unless the record already died, `false` if it did.
    pub fn retain(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then(|| count + 1)
            })
            .is_ok()
    }

    /// Decrement unless already at zero, returns the new count.
    pub fn release(&self) -> Option<usize> {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    pub fn metadata(&self) -> Metadata {
        let body = self.body.lock();
        Metadata {
            size: body.size,
            type_tag: self.type_tag,
            real_size: body.real_size(),
        }
    }

    /// Lock the body of a record that still has an owner. Once the count hit
    /// zero the body may already have been taken.
    pub fn lock_live(&self, reference: FieldRef) -> Result<MutexGuard<'_, Body>> {
        let body = self.body.lock();
        if self.refcount() == 0 {
            return Err(LangifError::InvalidReference(reference));
        }
        Ok(body)
    }

    pub fn ensure_strategy(&self, reference: FieldRef, expected: Strategy) -> Result<()> {
        if self.strategy != expected {
            return Err(LangifError::StrategyMismatch {
                reference,
                expected,
                found: self.strategy,
            });
        }
        Ok(())
    }

    /// Swap the body out for an empty one, leaving a dead shell behind.
    pub fn take_body(&self) -> Body {
        std::mem::replace(&mut *self.body.lock(), Body::empty())
    }
}

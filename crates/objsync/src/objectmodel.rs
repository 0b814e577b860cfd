use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

pub mod header;

use self::header::HeaderWord;

/// Reference to a heap object managed by the embedding runtime. The first
/// word of the object is its mark word; everything past it is opaque to this
/// crate.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct ObjectRef(NonNull<u8>);

unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// # Safety
    ///
    /// `addr` must point to a live object whose first word is a mark word
    /// and must stay valid while any monitor can still reach it.
    pub unsafe fn from_raw_address(addr: NonNull<u8>) -> Self {
        Self(addr)
    }

    pub fn to_raw_address(self) -> NonNull<u8> {
        self.0
    }

    fn header_slot(&self) -> &AtomicUsize {
        unsafe { &*(self.0.as_ptr() as *const AtomicUsize) }
    }

    pub fn mark(&self) -> HeaderWord {
        HeaderWord::from_raw(self.header_slot().load(Ordering::Acquire))
    }

    pub fn set_mark(&self, word: HeaderWord) {
        self.header_slot().store(word.value(), Ordering::Release);
    }

    /// Returns the witnessed word; equal to `expected` iff the swap took
    /// place.
    pub fn cas_set_mark(&self, new: HeaderWord, expected: HeaderWord) -> HeaderWord {
        match self.header_slot().compare_exchange(
            expected.value(),
            new.value(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => expected,
            Err(actual) => HeaderWord::from_raw(actual),
        }
    }
}

use easy_bitfield::{BitField, BitFieldTrait, FromBitfield, ToBitfield};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::{sync::object_monitor::ObjectMonitor, Runtime};

pub type TagBits = BitField<usize, HeaderTag, 0, 2, false>;
pub type PayloadBits = BitField<usize, usize, { TagBits::NEXT_BIT }, 62, false>;

/// Low two bits of the mark word. `Monitor` payload is the monitor address
/// shifted right by the tag width; everything else treats the payload as an
/// identity hash.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum HeaderTag {
    FastLocked = 0,
    Neutral = 1,
    Monitor = 2,
    Forwarded = 3,
}

impl<S: FromPrimitive> ToBitfield<S> for HeaderTag {
    fn one() -> Self {
        unreachable!()
    }

    fn zero() -> Self {
        unreachable!()
    }

    fn to_bitfield(self) -> S {
        S::from_u8(self as u8).unwrap()
    }
}

impl<S: ToPrimitive> FromBitfield<S> for HeaderTag {
    fn from_bitfield(value: S) -> Self {
        match value.to_u8().unwrap() {
            0 => Self::FastLocked,
            1 => Self::Neutral,
            2 => Self::Monitor,
            3 => Self::Forwarded,
            _ => {
                #[cfg(debug_assertions)]
                {
                    unreachable!("invalid header tag")
                }

                #[cfg(not(debug_assertions))]
                unsafe {
                    std::hint::unreachable_unchecked();
                }
            }
        }
    }

    fn from_i64(_value: i64) -> Self {
        unreachable!()
    }
}

/// One mark word. The word is plain data; atomicity lives in the object's
/// header slot ([`ObjectRef`](super::ObjectRef)).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct HeaderWord(usize);

impl HeaderWord {
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn value(self) -> usize {
        self.0
    }

    /// A neutral (unlocked, unmarked) word carrying an identity hash.
    pub fn neutral(hash: usize) -> Self {
        Self(PayloadBits::update(hash, TagBits::encode(HeaderTag::Neutral)))
    }

    pub fn tag(self) -> HeaderTag {
        TagBits::decode(self.0)
    }

    pub fn is_neutral(self) -> bool {
        self.tag() == HeaderTag::Neutral
    }

    pub fn has_monitor(self) -> bool {
        self.tag() == HeaderTag::Monitor
    }

    pub fn hash(self) -> usize {
        PayloadBits::decode(self.0)
    }

    pub fn encode_monitor<R: Runtime>(monitor: &ObjectMonitor<R>) -> Self {
        let addr = monitor as *const ObjectMonitor<R> as usize;
        debug_assert!((addr & 0b11) == 0, "monitor must be word aligned");
        Self(PayloadBits::update(
            addr >> TagBits::NEXT_BIT,
            TagBits::encode(HeaderTag::Monitor),
        ))
    }

    /// # Safety
    ///
    /// The word must have been produced by [`encode_monitor`](Self::encode_monitor)
    /// for a monitor of the same runtime that is still registry-owned.
    pub unsafe fn monitor<R: Runtime>(self) -> *const ObjectMonitor<R> {
        debug_assert!(self.has_monitor());
        (PayloadBits::decode(self.0) << TagBits::NEXT_BIT) as *const ObjectMonitor<R>
    }
}

impl std::fmt::Debug for HeaderWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderWord")
            .field("tag", &self.tag())
            .field("payload", &format_args!("{:#x}", PayloadBits::decode(self.0)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockVM;
    use crate::sync::object_monitor::ObjectMonitor;

    #[test]
    fn neutral_roundtrip() {
        let w = HeaderWord::neutral(0xdead_beef);
        assert!(w.is_neutral());
        assert!(!w.has_monitor());
        assert_eq!(w.hash(), 0xdead_beef);
    }

    #[test]
    fn monitor_roundtrip() {
        let m: Box<ObjectMonitor<MockVM>> = Box::new(ObjectMonitor::new());
        let w = HeaderWord::encode_monitor(&m);
        assert!(w.has_monitor());
        assert_eq!(unsafe { w.monitor::<MockVM>() }, &*m as *const _);
    }
}

//! Typed physical and virtual addresses.
//!
//! Physical and virtual addresses share the same arithmetic but must never
//! be mixed up, so both are instances of one generic type distinguished by
//! a zero-sized tag.

use core::cmp::{max, min};
use core::fmt::Debug;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Sub, SubAssign};

pub trait AddressKind: Clone + Copy + Eq + Ord + PartialEq + PartialOrd + Debug + Hash {}

#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct PhysKind;

#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct VirtKind;

impl AddressKind for PhysKind {}
impl AddressKind for VirtKind {}

#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct Address<Kind: AddressKind>(u64, PhantomData<Kind>);

pub type PhysAddress = Address<PhysKind>;
pub type VirtAddress = Address<VirtKind>;

impl<Kind: AddressKind> Address<Kind> {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw, PhantomData)
    }

    pub const fn zero() -> Self {
        Self::from_raw(0)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, length: Length) -> Option<Self> {
        Some(Self::from_raw(self.0.checked_add(length.0)?))
    }

    pub const fn is_aligned_to(self, alignment: u64) -> bool {
        self.0 == align_u64_down(self.0, alignment)
    }

    pub const fn is_aligned_to_length(self, alignment: Length) -> bool {
        self.is_aligned_to(alignment.0)
    }

    /// Largest address not above `self` aligned to `alignment`, a power of
    /// two.
    pub const fn align_down(self, alignment: u64) -> Self {
        Self::from_raw(align_u64_down(self.0, alignment))
    }

    /// Smallest address not below `self` aligned to `alignment`, a power of
    /// two.
    pub const fn align_up(self, alignment: u64) -> Self {
        Self::from_raw(align_u64_up(self.0, alignment))
    }
}

impl Address<VirtKind> {
    pub fn from_ptr<T>(p: *const T) -> Self {
        Self::from_raw(p as usize as u64)
    }

    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

impl<Kind: AddressKind> Add<Length> for Address<Kind> {
    type Output = Self;
    fn add(self, rhs: Length) -> Self {
        self.checked_add(rhs).unwrap()
    }
}

impl<Kind: AddressKind> AddAssign<Length> for Address<Kind> {
    fn add_assign(&mut self, rhs: Length) {
        *self = *self + rhs;
    }
}

impl<Kind: AddressKind> Sub<Length> for Address<Kind> {
    type Output = Self;
    fn sub(self, rhs: Length) -> Self {
        Self::from_raw(self.0.checked_sub(rhs.0).unwrap())
    }
}

impl<Kind: AddressKind> SubAssign<Length> for Address<Kind> {
    fn sub_assign(&mut self, rhs: Length) {
        *self = *self - rhs;
    }
}

impl<Kind: AddressKind> Sub<Self> for Address<Kind> {
    type Output = Length;
    fn sub(self, rhs: Self) -> Length {
        Length(self.0.checked_sub(rhs.0).unwrap())
    }
}

/// A byte count. Distinct from addresses so that "address + address" does
/// not typecheck.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct Length(u64);

impl Length {
    pub const fn from_raw(raw: u64) -> Length {
        Length(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn is_aligned_to(self, alignment: u64) -> bool {
        self.0 == align_u64_down(self.0, alignment)
    }

    pub const fn align_down(self, alignment: u64) -> Length {
        Length(align_u64_down(self.0, alignment))
    }

    pub const fn align_up(self, alignment: u64) -> Length {
        Length(align_u64_up(self.0, alignment))
    }

    pub const fn times(self, n: u64) -> Length {
        match self.0.checked_mul(n) {
            Some(v) => Length(v),
            None => panic!("length overflow"),
        }
    }
}

impl Add for Length {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Length(self.0.checked_add(rhs.0).unwrap())
    }
}

impl AddAssign for Length {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Length {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Length(self.0.checked_sub(rhs.0).unwrap())
    }
}

impl SubAssign for Length {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

/// A non-empty, contiguous run of addresses.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub struct Extent<Kind: AddressKind> {
    address: Address<Kind>,
    length: Length,
}

pub type PhysExtent = Extent<PhysKind>;
pub type VirtExtent = Extent<VirtKind>;

impl<Kind: AddressKind> Extent<Kind> {
    /// # Panics
    ///
    /// Panics if `length` is zero or the extent would wrap the address
    /// space.
    pub const fn new(address: Address<Kind>, length: Length) -> Self {
        match Self::new_checked(address, length) {
            Some(e) => e,
            None => panic!("empty or wrapping extent"),
        }
    }

    pub const fn new_checked(address: Address<Kind>, length: Length) -> Option<Self> {
        if length.as_raw() == 0 || length.as_raw() > u64::MAX - address.as_raw() {
            None
        } else {
            Some(Self { address, length })
        }
    }

    pub const fn from_raw(address: u64, length: u64) -> Self {
        Self::new(Address::from_raw(address), Length::from_raw(length))
    }

    pub const fn address(self) -> Address<Kind> {
        self.address
    }

    pub const fn length(self) -> Length {
        self.length
    }

    /// The first address just past the extent.
    pub fn end_address(self) -> Address<Kind> {
        self.address + self.length
    }

    /// The last address inside the extent.
    pub fn last_address(self) -> Address<Kind> {
        Address::from_raw(self.address.as_raw() + self.length.as_raw() - 1)
    }

    pub fn overlap(self, other: Self) -> Option<Self> {
        if self.address > other.address {
            return other.overlap(self);
        }

        let start = other.address;
        if start - self.address >= self.length {
            return None;
        }

        let length = min(self.length - (start - self.address), other.length);
        Some(Self {
            address: start,
            length,
        })
    }

    pub fn has_overlap(self, other: Self) -> bool {
        self.overlap(other).is_some()
    }

    pub fn contains(self, other: Self) -> bool {
        match self.overlap(other) {
            Some(o) => o == other,
            None => false,
        }
    }

    pub fn contains_address(self, addr: Address<Kind>) -> bool {
        addr >= self.address && addr <= self.last_address()
    }

    /// The part of `self` strictly left of `other`, if any.
    pub fn left_difference(self, other: Self) -> Option<Self> {
        if self.address >= other.address {
            return None;
        }

        let length = min(self.length, other.address - self.address);
        Some(Self {
            address: self.address,
            length,
        })
    }

    /// The part of `self` strictly right of `other`, if any.
    pub fn right_difference(self, other: Self) -> Option<Self> {
        if self.last_address() <= other.last_address() {
            return None;
        }

        let address = max(self.address, other.end_address());
        let length = self.length - (address - self.address);
        Some(Self { address, length })
    }

    /// Largest extent inside `self` whose endpoints are aligned to
    /// `alignment`, a power of two.
    pub fn shrink_to_alignment(self, alignment: u64) -> Option<Self> {
        let start = self.address.align_up(alignment);
        let end = self.end_address().align_down(alignment);
        if end <= start {
            None
        } else {
            Some(Self {
                address: start,
                length: end - start,
            })
        }
    }
}

/// Largest value not above `x` aligned to power-of-two `alignment`.
pub const fn align_u64_down(x: u64, alignment: u64) -> u64 {
    x & !(alignment - 1)
}

/// Smallest value not below `x` aligned to power-of-two `alignment`.
pub const fn align_u64_up(x: u64, alignment: u64) -> u64 {
    align_u64_down(x + (alignment - 1), alignment)
}

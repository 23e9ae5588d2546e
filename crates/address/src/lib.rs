use std::ops;
use std::fmt;
use std::fmt::Formatter;

#[derive(Eq, PartialEq, Clone, Copy, Hash)]
pub struct Base {
    pub value: usize,
}

impl From<usize> for Base {
    fn from(value: usize) -> Self {
        Self { value }
    }
}

impl ops::Add<&Offset> for &Base {
    type Output = Address;

    fn add(self, rhs: &Offset) -> Self::Output {
        Address::from(self.value + rhs.value)
    }
}

impl fmt::Debug for Base {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Base({:#x})", self.value)
    }
}

/// Distance from a module base, usually an RVA out of an export table.
#[derive(Eq, PartialEq, Clone, Copy, Hash)]
pub struct Offset {
    pub value: usize,
}

impl Offset {
    pub fn as_usize(&self) -> usize {
        self.value
    }
}

impl From<u32> for Offset {
    fn from(value: u32) -> Self {
        Self { value: value as usize }
    }
}

impl From<usize> for Offset {
    fn from(value: usize) -> Self {
        Self { value }
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Offset(+{:#x})", self.value)
    }
}

/// Absolute virtual address inside some (possibly remote) address space.
#[derive(Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash)]
pub struct Address {
    pub value: usize,
}

impl Address {
    pub fn as_usize(&self) -> usize {
        self.value
    }

    pub fn as_u64(&self) -> u64 {
        self.value as u64
    }

    pub fn add(&self, length: usize) -> Self {
        Self { value: self.value + length }
    }

    /// Offset of this address relative to `base`, if it lies above it.
    pub fn offset_from(&self, base: &Base) -> Option<Offset> {
        self.value.checked_sub(base.value).map(Offset::from)
    }

    /// Displacement a relative branch of `instruction_length` bytes placed at this address
    /// needs to reach `target`. `None` when the target is out of rel32 range.
    pub fn rel32_to(&self, target: &Address, instruction_length: usize) -> Option<i32> {
        let next = self.value as i128 + instruction_length as i128;
        let distance = target.value as i128 - next;

        i32::try_from(distance).ok()
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Self { value }
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self { value: value as usize }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.value)
    }
}

/// Half-open byte range `[start, start + length)`.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct Span {
    pub start: Address,
    pub length: usize,
}

impl Span {
    pub fn new(start: Address, length: usize) -> Self {
        Self { start, length }
    }

    pub fn end(&self) -> Address {
        self.start.add(self.length)
    }

    pub fn as_range(&self) -> ops::Range<usize> {
        self.start.value..self.end().value
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Address, Base, Offset, Span};

    #[test]
    fn we_can_add_a_base_and_an_offset() {
        let base: Base = Base::from(0x1000);
        let offset: Offset = Offset::from(0x100u32);
        let address = &base + &offset;

        assert_eq!(address.value, 0x1100);
    }

    #[test]
    fn we_can_get_an_offset_back_from_an_address() {
        let base: Base = 0x400000.into();
        let address = Address::from(0x401234usize);

        assert_eq!(address.offset_from(&base), Some(Offset::from(0x1234usize)));
        assert_eq!(Address::from(0x1000usize).offset_from(&base), None);
    }

    #[test]
    fn we_can_compute_a_rel32_jump() {
        let site = Address::from(0x1000usize);

        assert_eq!(site.rel32_to(&Address::from(0x2000usize), 5), Some(0xffb));
        assert_eq!(site.rel32_to(&Address::from(0x1000usize), 5), Some(-5));
    }

    #[test]
    fn rel32_gives_up_past_two_gigabytes() {
        let site = Address::from(0x1000usize);
        let far = Address::from(0x1_0000_2000u64);

        assert_eq!(site.rel32_to(&far, 5), None);
    }

    #[test]
    fn we_can_detect_overlapping_spans() {
        let a = Span::new(Address::from(0x1000usize), 5);
        let b = Span::new(Address::from(0x1004usize), 5);
        let c = Span::new(Address::from(0x1005usize), 5);

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c), "Adjacent spans should not count as overlapping");
        assert_eq!(a.as_range(), 0x1000..0x1005);
    }
}

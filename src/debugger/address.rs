use std::fmt::{Display, Formatter};

/// Represent an address in a running debuggee.
/// Relocated address is a `GlobalAddress` plus the runtime base the OS loader
/// picked for the owning image.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Default, PartialOrd, Ord)]
pub struct RelocatedAddress(u32);

impl RelocatedAddress {
    #[inline(always)]
    pub fn remove_base(self, base: RelocatedAddress) -> GlobalAddress {
        GlobalAddress(self.0.wrapping_sub(base.0))
    }

    #[inline(always)]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for RelocatedAddress {
    fn from(addr: u32) -> Self {
        RelocatedAddress(addr)
    }
}

impl From<u64> for RelocatedAddress {
    fn from(addr: u64) -> Self {
        RelocatedAddress(addr as u32)
    }
}

impl From<usize> for RelocatedAddress {
    fn from(addr: usize) -> Self {
        RelocatedAddress(addr as u32)
    }
}

impl From<RelocatedAddress> for u32 {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0
    }
}

impl From<RelocatedAddress> for u64 {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0 as u64
    }
}

impl Display for RelocatedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#010x}", self.0))
    }
}

/// Represent an address as the compiler emitted it, relative to the image
/// preferred base. This address is unique per image but not per process.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct GlobalAddress(u32);

impl GlobalAddress {
    /// Relocate the address into the address-space segment of a loaded image.
    #[inline(always)]
    pub fn relocate(self, base: RelocatedAddress) -> RelocatedAddress {
        RelocatedAddress(base.0.wrapping_add(self.0))
    }

    #[inline(always)]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for GlobalAddress {
    fn from(addr: u32) -> Self {
        GlobalAddress(addr)
    }
}

impl From<u64> for GlobalAddress {
    fn from(addr: u64) -> Self {
        GlobalAddress(addr as u32)
    }
}

impl From<GlobalAddress> for u32 {
    fn from(addr: GlobalAddress) -> Self {
        addr.0
    }
}

impl From<GlobalAddress> for u64 {
    fn from(addr: GlobalAddress) -> Self {
        addr.0 as u64
    }
}

impl Display for GlobalAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#010x}", self.0))
    }
}

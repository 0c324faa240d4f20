//! Identifier types

use core::cell::Cell;
use core::fmt;

/// Identifier of a pooled fiber
///
/// Equal to the fiber's index in the pool, so ids are dense in `0..size`.
/// `u32::MAX` is reserved as the "no fiber" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u32);

impl FiberId {
    pub const NONE: FiberId = FiberId(u32::MAX);

    #[inline]
    pub const fn new(id: u32) -> Self {
        FiberId(id)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Pool index
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    pub const fn to_option(self) -> Option<FiberId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u32> for FiberId {
    #[inline]
    fn from(id: u32) -> Self {
        FiberId(id)
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

macro_rules! serial_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(raw: u64) -> Self {
                $name(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

serial_id!(
    /// Right to resume a suspended fiber. A fresh token is minted for every
    /// suspension; a resume carrying any other token is stale.
    SuspendToken
);

serial_id!(
    /// Identity of one timeout scope, unique for the scheduler's lifetime
    ScopeId
);

serial_id!(
    /// Position of one waiter in a descriptor's read or write queue
    WaiterId
);

/// Monotonic id source for the single-threaded scheduler
#[derive(Debug, Default)]
pub struct Serial(Cell<u64>);

impl Serial {
    pub const fn new() -> Self {
        Serial(Cell::new(0))
    }

    /// Next raw value, starting at 1
    #[inline]
    pub fn next_raw(&self) -> u64 {
        let next = self.0.get() + 1;
        self.0.set(next);
        next
    }

    #[inline]
    pub fn next<T: From<u64>>(&self) -> T {
        T::from(self.next_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_basics() {
        let id = FiberId::new(7);
        assert_eq!(id.as_u32(), 7);
        assert_eq!(id.as_usize(), 7);
        assert_eq!(id.to_option(), Some(id));
        assert_eq!(format!("{}", id), "7");
    }

    #[test]
    fn test_fiber_id_none() {
        let none = FiberId::default();
        assert!(none.is_none());
        assert_eq!(none.to_option(), None);
        assert_eq!(format!("{:?}", none), "FiberId(NONE)");
    }

    #[test]
    fn test_serial_is_monotonic() {
        let serial = Serial::new();
        let a: SuspendToken = serial.next();
        let b: SuspendToken = serial.next();
        assert_eq!(a.as_u64(), 1);
        assert!(b > a);
        assert_ne!(a, b);
    }
}

//! `Mib`, quantity of memory measured in mebibytes.
//
// The admission arithmetic in remake-memguard is all done in whole MiB:
// compiler peaks are tens to thousands of MiB, so byte precision buys
// nothing and MiB keeps every quantity comfortably inside a u32 even on
// very large hosts.  We use u64 for headroom in sums.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt::{self, Display};
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// Quantity of memory, in whole mebibytes.
///
/// Like `u64`, but it `Display`s with its unit, and its arithmetic helpers
/// saturate instead of wrapping: live RSS can legitimately exceed a
/// recorded peak, and the difference must clamp to zero rather than
/// underflow.
#[derive(Debug, Clone, Copy, Hash, Default, Eq, PartialEq, Ord, PartialOrd)] //
#[derive(From, Into, Serialize, Deserialize)]
#[serde(transparent)]
#[allow(clippy::exhaustive_structs)] // this is a behavioural newtype wrapper
pub struct Mib(pub u64);

/// Error parsing a [`Mib`] from a string
#[derive(Error, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum InvalidMib {
    /// Not a decimal number (with an optional `MiB` suffix)
    #[error("memory quantity has bad syntax (expected a decimal MiB count)")]
    BadSyntax,
}

impl Mib {
    /// Zero mebibytes
    pub const ZERO: Mib = Mib(0);

    /// Maximum for the type
    pub const MAX: Mib = Mib(u64::MAX);

    /// Return the value as a plain number of MiB
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Saturating addition
    pub const fn saturating_add(self, other: Mib) -> Mib {
        Mib(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction: clamps at zero instead of underflowing
    pub const fn saturating_sub(self, other: Mib) -> Mib {
        Mib(self.0.saturating_sub(other.0))
    }

    /// Convert a byte count, rounding down
    pub const fn from_bytes(bytes: u64) -> Mib {
        Mib(bytes / (1024 * 1024))
    }

    /// Convert a kibibyte count (the unit `/proc` reports), rounding down
    pub const fn from_kib(kib: u64) -> Mib {
        Mib(kib / 1024)
    }
}

impl Add for Mib {
    type Output = Mib;
    fn add(self, other: Mib) -> Mib {
        self.saturating_add(other)
    }
}

impl AddAssign for Mib {
    fn add_assign(&mut self, other: Mib) {
        *self = self.saturating_add(other);
    }
}

impl Sum for Mib {
    fn sum<I: Iterator<Item = Mib>>(iter: I) -> Mib {
        iter.fold(Mib::ZERO, Mib::saturating_add)
    }
}

impl Display for Mib {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} MiB", self.0)
    }
}

impl FromStr for Mib {
    type Err = InvalidMib;
    fn from_str(s: &str) -> Result<Self, InvalidMib> {
        let s = s.trim();
        let s = s.strip_suffix("MiB").unwrap_or(s).trim_end();
        let n: u64 = s.parse().map_err(|_| InvalidMib::BadSyntax)?;
        Ok(Mib(n))
    }
}

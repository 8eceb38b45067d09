// ── Fixed-width hardware profiles ──
//
// ACA power profiles and subcarrier modulation arrays are 512 elements wide
// on every supported chipset. A profile is either empty (no data yet) or
// holds exactly `PROFILE_LEN` elements; nothing in between is representable.

use std::ops::Deref;

use serde::{Deserialize, Serialize};

use super::limits::PROFILE_LEN;
use crate::error::InvalidArgument;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<T>", into = "Vec<T>")]
#[serde(bound(
    serialize = "T: Clone + Serialize",
    deserialize = "T: Deserialize<'de>"
))]
pub struct Profile<T> {
    values: Vec<T>,
}

impl<T> Profile<T> {
    pub const fn empty() -> Self {
        Self { values: Vec::new() }
    }

    /// Wrap hardware output, rejecting anything but a full-width profile.
    pub fn new(values: Vec<T>) -> Result<Self, InvalidArgument> {
        if values.len() != PROFILE_LEN {
            return Err(InvalidArgument::ProfileLength {
                expected: PROFILE_LEN,
                got: values.len(),
            });
        }
        Ok(Self { values })
    }

    /// Full-width profile with every element set to `value`.
    pub fn filled(value: T) -> Self
    where
        T: Clone,
    {
        Self {
            values: vec![value; PROFILE_LEN],
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }
}

impl<T> Default for Profile<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Deref for Profile<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.values
    }
}

impl<T> TryFrom<Vec<T>> for Profile<T> {
    type Error = InvalidArgument;

    fn try_from(values: Vec<T>) -> Result<Self, Self::Error> {
        if values.is_empty() {
            return Ok(Self::empty());
        }
        Self::new(values)
    }
}

impl<T> From<Profile<T>> for Vec<T> {
    fn from(profile: Profile<T>) -> Self {
        profile.values
    }
}

/// Per-channel received power in dBm.
pub type PowerProfile = Profile<i32>;

/// Per-subcarrier byte values (modulation order, NPER, VLPER).
pub type SubcarrierProfile = Profile<u8>;

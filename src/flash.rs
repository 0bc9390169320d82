// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The platform flash abstraction the store is built on.
//!
//! This is an external collaborator the store consumes rather than owns: a
//! raw, two-region NOR flash device. The store never talks to hardware
//! directly, only through this trait, so that the same store code runs
//! against real flash and against the in-memory mock used by tests.

/// Identifies one of the store's two swap regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionIndex {
    Zero,
    One,
}

impl RegionIndex {
    /// The other region.
    pub fn other(self) -> RegionIndex {
        match self {
            RegionIndex::Zero => RegionIndex::One,
            RegionIndex::One => RegionIndex::Zero,
        }
    }

    pub(crate) fn as_usize(self) -> usize {
        match self {
            RegionIndex::Zero => 0,
            RegionIndex::One => 1,
        }
    }
}

/// Synchronous access to a two-region raw NOR flash device.
///
/// Every method runs to completion before returning, matching the
/// single-threaded, no-suspension-points model the store assumes. An
/// implementation backed by real hardware is expected to block on the
/// underlying controller.
///
/// # The write contract
///
/// `write` may only ever clear bits from 1 to 0 within the addressed range.
/// Writing a 1 over a bit that is currently 0 is undefined on real NOR flash
/// and this trait does not attempt to detect it at the interface level (doing
/// so would require a read-modify-compare on every write, which real
/// controllers do not offer cheaply). The mock flash used by this crate's
/// tests (see the `mock` module) does check it, since the store's entire
/// crash-safety argument depends on this contract holding.
///
/// `offset` and `buf.len()` are always 4-byte aligned for every call the
/// store makes; implementations backed by word-addressed hardware may rely
/// on this.
pub trait Flash {
    /// The error type reported by this platform's operations.
    type Error;

    /// Size in bytes of each of the two regions. Both regions are always the
    /// same size.
    fn region_size(&self) -> u32;

    /// Reads `buf.len()` bytes starting at `offset` within `region` into `buf`.
    fn read(&mut self, region: RegionIndex, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Writes `buf` at `offset` within `region`. Only clears bits; see above.
    fn write(&mut self, region: RegionIndex, offset: u32, buf: &[u8]) -> Result<(), Self::Error>;

    /// Erases the entirety of `region` back to all-ones.
    fn erase(&mut self, region: RegionIndex) -> Result<(), Self::Error>;
}

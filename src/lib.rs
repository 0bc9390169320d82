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

//! A log-structured key-value store over a two-region raw NOR flash swap.
//!
//! The store keeps an append-only log of records in one of two equal-sized
//! "swap" regions. Every mutation appends a new record to the log; nothing
//! is ever overwritten in place except a record's own flag bits, which only
//! ever clear (1 -> 0) as the record moves through its lifecycle. This
//! matches the physical constraint of NOR flash, where a write can clear
//! bits but an erase -- coarse-grained and comparatively slow -- is the only
//! way to set them back to 1.
//!
//! When the active region fills up, [`Store`] compacts: it copies every
//! live, non-shadowed record into the other region, marks that region
//! active, and demotes the old one. Because the demotion is itself a single
//! bit clear on the old region's header, and it only happens after the new
//! region's header has already been written, a crash at any point during
//! compaction leaves exactly one region (old or new) that a fresh [`init`]
//! will find and recover from.
//!
//! ```ignore
//! // `flash` is a caller-supplied `impl Flash` backed by real hardware.
//! let mut store = swapkv::Store::init(flash)?;
//! store.set(0x0001, b"hello")?;
//!
//! let mut buf = [0u8; 5];
//! let len = store.get(0x0001, 0, &mut buf)?;
//! assert_eq!(&buf[..len as usize], b"hello");
//! # Ok::<(), swapkv::Error<()>>(())
//! ```
//!
//! [`init`]: Store::init

#![cfg_attr(not(test), no_std)]

mod error;
mod flash;
mod layout;
mod store;

#[cfg(test)]
mod proptests;

pub use error::Error;
pub use flash::{Flash, RegionIndex};
pub use layout::MAX_PAYLOAD;
pub use store::{Iter, Store};

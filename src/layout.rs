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

//! On-flash binary layout: the swap header and the record header, and the
//! inverse-polarity flag bits that make the record header a crash-safe state
//! machine.
//!
//! All multi-byte fields are little-endian, to keep the on-flash layout
//! byte-exact and portable across host and target. Everything here is a pure
//! data/encoding concern -- no flash I/O happens in this module.

use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert_eq;

/// Minimum write/erase granularity. All offsets and lengths the store hands
/// to [`crate::Flash`] are multiples of this.
pub const WORD_SIZE: u32 = 4;

/// Largest payload a single record may carry.
pub const MAX_PAYLOAD: usize = 256;

/// On-flash size of a [`RecordHeader`], in bytes.
pub const RECORD_HEADER_SIZE: usize = 8;

/// On-flash size of the swap header (one flash word: a single `u32` marker).
pub const SWAP_HEADER_SIZE: u32 = 4;

const_assert_eq!(RECORD_HEADER_SIZE % WORD_SIZE as usize, 0);
const_assert_eq!(SWAP_HEADER_SIZE % WORD_SIZE, 0);

/// Rounds `length` up to the next multiple of [`WORD_SIZE`] and adds the
/// record header size, giving the number of bytes a record with this payload
/// length occupies on flash.
pub fn record_size(length: u16) -> u32 {
    let padded = (u32::from(length) + WORD_SIZE - 1) / WORD_SIZE * WORD_SIZE;
    RECORD_HEADER_SIZE as u32 + padded
}

/// The two valid values of the swap header's marker word.
///
/// The constants differ in exactly one bit (bit 1), so an `Active` header can
/// be demoted to `Inactive` with a single 1-to-0 clear -- no erase needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SwapMarker {
    Active = 0xBE5C_C5EE,
    Inactive = 0xBE5C_C5EC,
}

const_assert_eq!(
    (SwapMarker::Active as u32) ^ (SwapMarker::Inactive as u32),
    0x0000_0002
);

impl SwapMarker {
    /// Decodes a marker word. Any value other than the two known markers
    /// means the region is neither active nor a demoted-active region --
    /// treated the same as `None` by region selection.
    pub fn decode(word: u32) -> Option<SwapMarker> {
        match word {
            x if x == SwapMarker::Active as u32 => Some(SwapMarker::Active),
            x if x == SwapMarker::Inactive as u32 => Some(SwapMarker::Inactive),
            _ => None,
        }
    }

    pub fn encode(self) -> [u8; SWAP_HEADER_SIZE as usize] {
        let mut buf = [0u8; SWAP_HEADER_SIZE as usize];
        LittleEndian::write_u32(&mut buf, self as u32);
        buf
    }
}

bitflags::bitflags! {
    /// Record-header flag bits, stored with inverse polarity: a 1 bit means
    /// the event the bit names has *not* happened yet; a 0 bit means it has.
    /// Every state transition clears exactly one bit, which is always legal
    /// on flash without an erase. Never treat a bit's raw value as the
    /// logical boolean of the event it names -- use the `is_*` helpers below.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u16 {
        /// Cleared when the header+payload write begins. Still set (1) only
        /// for a torn write truncated before that first write completed.
        const ADD_BEGIN = 0b0000_0000_0000_0001;
        /// Cleared in the second write that commits the record.
        const ADD_COMPLETE = 0b0000_0000_0000_0010;
        /// Cleared to tombstone the record.
        const DELETE = 0b0000_0000_0000_0100;
        /// Cleared if this record is the head of its key's logical chain.
        const FIRST = 0b0000_0000_0000_1000;
    }
}

/// The flags word of a record that has never been written to: every bit,
/// including the 12 reserved bits above `FIRST`, reads as 1 on erased flash.
pub const FLAGS_ERASED: u16 = 0xFFFF;

impl RecordFlags {
    /// A fresh flags value for a record about to be written: every defined
    /// bit unset (1), i.e. none of the four events have happened yet, with
    /// the 12 undefined high bits left at their erased value (1) rather than
    /// cleared, since this implementation claims no meaning for them.
    pub fn fresh() -> RecordFlags {
        RecordFlags::from_bits_retain(FLAGS_ERASED)
    }
}

/// A decoded 8-byte record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: u16,
    pub flags: RecordFlags,
    /// Payload length in bytes, as stored (unpadded).
    pub length: u16,
    /// Reserved field; preserved byte-for-byte across read/modify/write so
    /// this implementation never clears a bit that does not belong to it.
    pub reserved: u16,
}

impl RecordHeader {
    /// Builds the header for a brand-new record, with `AddBegin` already
    /// cleared (the write is "in progress" the instant this header is
    /// constructed) and `First` cleared iff `first` is requested. Neither
    /// `AddComplete` nor `Delete` are cleared yet -- see
    /// [`Store::add`](crate::Store::add) for why those are later, separate
    /// writes.
    pub fn new_in_progress(key: u16, length: u16, first: bool) -> RecordHeader {
        let mut flags = RecordFlags::fresh();
        flags.remove(RecordFlags::ADD_BEGIN);
        if first {
            flags.remove(RecordFlags::FIRST);
        }
        RecordHeader { key, flags, length, reserved: 0xFFFF }
    }

    /// A record is valid iff it has not been tombstoned (`Delete` bit still
    /// set) and its write has been committed (`AddComplete` bit cleared).
    pub fn is_valid(&self) -> bool {
        self.flags.contains(RecordFlags::DELETE) && !self.flags.contains(RecordFlags::ADD_COMPLETE)
    }

    /// Whether the initial header+payload write never completed (a torn
    /// write left by power loss mid-`Add`).
    pub fn is_torn(&self) -> bool {
        self.flags.contains(RecordFlags::ADD_BEGIN)
    }

    /// Whether this record has been fully committed, regardless of whether
    /// it is still live (not tombstoned). Used only to find the write
    /// frontier during recovery scanning -- a committed-but-tombstoned
    /// record still advances the frontier, since tombstoning never moves a
    /// record.
    pub fn is_committed(&self) -> bool {
        !self.flags.contains(RecordFlags::ADD_BEGIN) && !self.flags.contains(RecordFlags::ADD_COMPLETE)
    }

    /// Whether this record is the head of its key's logical chain.
    pub fn is_chain_head(&self) -> bool {
        !self.flags.contains(RecordFlags::FIRST)
    }

    pub fn is_tombstoned(&self) -> bool {
        !self.flags.contains(RecordFlags::DELETE)
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        LittleEndian::write_u16(&mut buf[0..2], self.key);
        LittleEndian::write_u16(&mut buf[2..4], self.flags.bits());
        LittleEndian::write_u16(&mut buf[4..6], self.length);
        LittleEndian::write_u16(&mut buf[6..8], self.reserved);
        buf
    }

    pub fn decode(buf: &[u8; RECORD_HEADER_SIZE]) -> RecordHeader {
        RecordHeader {
            key: LittleEndian::read_u16(&buf[0..2]),
            flags: RecordFlags::from_bits_retain(LittleEndian::read_u16(&buf[2..4])),
            length: LittleEndian::read_u16(&buf[4..6]),
            reserved: LittleEndian::read_u16(&buf[6..8]),
        }
    }
}

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

//! The log-structured key-value store itself.
//!
//! `Store<F>` owns a [`Flash`] platform and keeps just enough volatile state
//! (which region is active, and where its write frontier sits) to serve
//! `get`/`set`/`add`/`delete` without rescanning on every call. All of that
//! volatile state is fully reconstructible from flash contents alone, which
//! is what makes `init` a recovery procedure rather than a one-time setup.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::flash::{Flash, RegionIndex};
use crate::layout::{
    record_size, RecordFlags, RecordHeader, SwapMarker, MAX_PAYLOAD, RECORD_HEADER_SIZE, SWAP_HEADER_SIZE,
};

/// A persistent key-value store over a two-region raw flash swap.
///
/// See the crate documentation for the on-flash layout and crash-safety
/// argument this type implements.
pub struct Store<F: Flash> {
    flash: F,
    swap_size: u32,
    swap_index: RegionIndex,
    swap_used: u32,
    erase_counter: u16,
}

struct Hit {
    header_offset: u32,
    length: u16,
}

impl<F: Flash> Store<F> {
    /// Brings the store to a consistent state from whatever is currently on
    /// `flash`: picks the active region (wiping fresh/unformatted flash),
    /// locates the write frontier, and compacts away any partially-written
    /// tail left by a prior power loss.
    pub fn init(flash: F) -> Result<Store<F>, F::Error> {
        let swap_size = flash.region_size();
        let mut store = Store {
            flash,
            swap_size,
            swap_index: RegionIndex::Zero,
            swap_used: SWAP_HEADER_SIZE,
            erase_counter: 0,
        };

        let active = match store.read_swap_marker(RegionIndex::Zero)? {
            Some(SwapMarker::Active) => Some(RegionIndex::Zero),
            _ => match store.read_swap_marker(RegionIndex::One)? {
                Some(SwapMarker::Active) => Some(RegionIndex::One),
                _ => None,
            },
        };

        let active = match active {
            Some(region) => region,
            None => {
                debug!("no active swap region found, wiping");
                store.wipe()?;
                return Ok(store);
            }
        };

        store.swap_index = active;
        store.scan_frontier()?;
        store.sanitize_free_space()?;
        Ok(store)
    }

    /// Returns a 16-bit saturating count of how many times region 0 has
    /// been erased over this store's lifetime. Volatile: resets to 0 every
    /// time `init` runs, regardless of flash contents.
    pub fn get_erase_counter(&self) -> u16 {
        self.erase_counter
    }

    /// Returns the *index*-th live record for `key` into `out`, where index
    /// 0 is always the newest logical value (the head of the most recent
    /// `Set`/`Add` chain). Copies `min(out.len(), record length)` bytes into
    /// `out` and returns the record's full length, even if `out` was too
    /// small to hold all of it.
    pub fn get(&mut self, key: u16, index: u16, out: &mut [u8]) -> Result<u16, F::Error> {
        match self.find(key, index)? {
            Some(hit) => {
                let n = core::cmp::min(out.len(), hit.length as usize);
                if n > 0 {
                    self.flash
                        .read(self.swap_index, hit.header_offset + RECORD_HEADER_SIZE as u32, &mut out[..n])
                        .map_err(Error::Platform)?;
                }
                Ok(hit.length)
            }
            None => Err(Error::NotFound),
        }
    }

    /// Overwrites the logical value of `key`: starts a new chain (`First`
    /// set), shadowing every record written for this key before it. Prior
    /// records are not touched here; they are dropped the next time
    /// compaction runs (see [`Self::get`]'s chain-head semantics and the
    /// crate's compaction routine).
    pub fn set(&mut self, key: u16, value: &[u8]) -> Result<(), F::Error> {
        self.add_record(key, true, value)
    }

    /// Appends a new value to `key`'s chain. The very first `add` for a key
    /// behaves like [`Self::set`] (it probes with `get(key, 0, ..)` first
    /// and marks itself as the chain head iff that probe misses).
    pub fn add(&mut self, key: u16, value: &[u8]) -> Result<(), F::Error> {
        let first = self.find(key, 0)?.is_none();
        self.add_record(key, first, value)
    }

    /// Tombstones record(s) for `key`. `Some(index)` deletes only that
    /// ordinal; `None` deletes every live record for the key. Returns
    /// `Err(NotFound)` if nothing matched.
    pub fn delete(&mut self, key: u16, index: Option<u16>) -> Result<(), F::Error> {
        let mut counter: u16 = 0;
        let mut deleted_any = false;
        let mut offset = SWAP_HEADER_SIZE;
        while offset < self.swap_used {
            let mut header = self.read_header(self.swap_index, offset)?;
            let size = record_size(header.length);
            if header.is_valid() && header.key == key {
                if header.is_chain_head() {
                    counter = 0;
                }
                let should_tombstone = match index {
                    None => true,
                    Some(i) => counter == i,
                };
                if should_tombstone {
                    header.flags.remove(RecordFlags::DELETE);
                    self.write_header(self.swap_index, offset, &header)?;
                    deleted_any = true;
                }
                // Deleting the chain head (index 0) of a chain of length >=
                // 2 must promote the surviving next record to head, or the
                // chain loses its `First` marker entirely. If power is lost
                // between the two writes this leaves a headless-but-ordered
                // chain, which is tolerated: readers always start their local
                // index at 0, so the absence of a `First` marker just means
                // indexing begins at the first surviving record.
                if index == Some(0) && counter == 1 {
                    header.flags.remove(RecordFlags::FIRST);
                    self.write_header(self.swap_index, offset, &header)?;
                }
                counter += 1;
            }
            offset += size;
        }
        if deleted_any {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Resets the entire store: erases region 0 and starts a fresh, empty
    /// log there. Region 1 is left untouched; it is only erased the next
    /// time compaction runs.
    pub fn wipe(&mut self) -> Result<(), F::Error> {
        self.flash.erase(RegionIndex::Zero).map_err(Error::Platform)?;
        self.erase_counter = self.erase_counter.saturating_add(1);
        self.write_swap_marker(RegionIndex::Zero, SwapMarker::Active)?;
        self.swap_index = RegionIndex::Zero;
        self.swap_used = SWAP_HEADER_SIZE;
        Ok(())
    }

    /// Iterates the live chain for `key`, starting at index 0, yielding
    /// whatever [`Self::get`] would return at each ordinal until it first
    /// misses.
    pub fn iter(&mut self, key: u16) -> Iter<'_, F> {
        Iter { store: self, key, index: 0, done: false }
    }

    /// Reclaims the underlying flash platform, for embedders that need it
    /// back (e.g. to hand it to a different subsystem at shutdown).
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// The current write frontier within the active region. Exposed only to
    /// this crate's own tests, which assert on it directly.
    #[cfg(test)]
    pub(crate) fn swap_used(&self) -> u32 {
        self.swap_used
    }

    fn add_record(&mut self, key: u16, first: bool, value: &[u8]) -> Result<(), F::Error> {
        assert!(value.len() <= MAX_PAYLOAD, "payload exceeds the store's maximum record size");
        let length = value.len() as u16;
        let size = record_size(length);

        if !self.fits(size) {
            self.swap()?;
            if !self.fits(size) {
                return Err(Error::NoSpace);
            }
        }

        let offset = self.swap_used;
        let header = RecordHeader::new_in_progress(key, length, first);
        self.write_record(self.swap_index, offset, &header, value)?;

        let mut committed = header;
        committed.flags.remove(RecordFlags::ADD_COMPLETE);
        self.write_header(self.swap_index, offset, &committed)?;

        self.swap_used = offset + size;
        Ok(())
    }

    fn fits(&self, size: u32) -> bool {
        self.swap_used.checked_add(size).map_or(false, |end| end <= self.swap_size)
    }

    /// Finds the *index*-th live record for `key`, where the ordinal resets
    /// to 0 -- discarding any hit already recorded -- every time a chain
    /// head is encountered. Resetting the hit as well as the counter is
    /// what makes a `Set` after a run of `Add`s correctly shadow the whole
    /// prior chain rather than leaving its tail addressable.
    fn find(&mut self, key: u16, index: u16) -> Result<Option<Hit>, F::Error> {
        let mut counter: u16 = 0;
        let mut hit: Option<Hit> = None;
        let mut offset = SWAP_HEADER_SIZE;
        while offset < self.swap_used {
            let header = self.read_header(self.swap_index, offset)?;
            let size = record_size(header.length);
            if header.is_valid() && header.key == key {
                if header.is_chain_head() {
                    counter = 0;
                    hit = None;
                }
                if counter == index {
                    hit = Some(Hit { header_offset: offset, length: header.length });
                }
                counter += 1;
            }
            offset += size;
        }
        Ok(hit)
    }

    fn scan_frontier(&mut self) -> Result<(), F::Error> {
        let limit = self.swap_size.saturating_sub(RECORD_HEADER_SIZE as u32);
        let mut offset = SWAP_HEADER_SIZE;
        while offset <= limit {
            let header = self.read_header(self.swap_index, offset)?;
            if !header.is_committed() {
                break;
            }
            offset += record_size(header.length);
        }
        self.swap_used = offset;
        Ok(())
    }

    /// Verifies the frontier is aligned and the tail is erased, compacting
    /// if either check fails. A misaligned or dirty tail means a torn write
    /// was left in place by a prior crash; it must not be written over
    /// directly, since that would clear bits in a record whose header we
    /// have not yet reconstructed.
    fn sanitize_free_space(&mut self) -> Result<(), F::Error> {
        let aligned = self.swap_used % crate::layout::WORD_SIZE == 0;
        let tail_erased = aligned && self.tail_is_erased()?;
        if !aligned || !tail_erased {
            warn!("dirty or misaligned frontier at recovery, compacting");
            self.swap()?;
        }
        Ok(())
    }

    fn tail_is_erased(&mut self) -> Result<bool, F::Error> {
        let mut offset = self.swap_used;
        let mut buf = [0u8; 64];
        while offset < self.swap_size {
            let chunk = core::cmp::min(buf.len() as u32, self.swap_size - offset) as usize;
            self.flash.read(self.swap_index, offset, &mut buf[..chunk]).map_err(Error::Platform)?;
            if buf[..chunk].iter().any(|&b| b != 0xFF) {
                return Ok(false);
            }
            offset += chunk as u32;
        }
        Ok(true)
    }

    /// Compacts all live, non-shadowed records into the inactive region and
    /// flips active. The new-`ACTIVE`-before-old-`INACTIVE` write ordering
    /// is what keeps a crash mid-swap from ever leaving neither region
    /// active; see the crate's top-level documentation.
    fn swap(&mut self) -> Result<(), F::Error> {
        let src = self.swap_index;
        let dst = src.other();
        trace!("compacting region {:?} into {:?}", src, dst);

        self.flash.erase(dst).map_err(Error::Platform)?;
        if matches!(dst, RegionIndex::Zero) {
            self.erase_counter = self.erase_counter.saturating_add(1);
        }

        let mut src_offset = SWAP_HEADER_SIZE;
        let mut dst_offset = SWAP_HEADER_SIZE;
        let mut payload = [0u8; MAX_PAYLOAD];
        while src_offset < self.swap_used {
            let header = self.read_header(src, src_offset)?;
            if header.is_torn() {
                break;
            }
            let size = record_size(header.length);
            if header.is_valid() && !self.does_valid_record_exist(src, src_offset + size, header.key)? {
                let len = header.length as usize;
                self.flash
                    .read(src, src_offset + RECORD_HEADER_SIZE as u32, &mut payload[..len])
                    .map_err(Error::Platform)?;
                self.write_record(dst, dst_offset, &header, &payload[..len])?;
                dst_offset += size;
            }
            src_offset += size;
        }

        self.write_swap_marker(dst, SwapMarker::Active)?;
        self.write_swap_marker(src, SwapMarker::Inactive)?;
        self.swap_index = dst;
        self.swap_used = dst_offset;
        debug!("compaction done, {} bytes live", dst_offset - SWAP_HEADER_SIZE);
        Ok(())
    }

    /// Whether a later, valid, chain-head record with `key` exists in
    /// `[offset, swapUsed)` of `region` -- the predicate that collapses a
    /// `Set`-shadowed chain during compaction.
    fn does_valid_record_exist(&mut self, region: RegionIndex, mut offset: u32, key: u16) -> Result<bool, F::Error> {
        while offset < self.swap_used {
            let header = self.read_header(region, offset)?;
            let size = record_size(header.length);
            if header.is_valid() && header.key == key && header.is_chain_head() {
                return Ok(true);
            }
            offset += size;
        }
        Ok(false)
    }

    fn read_header(&mut self, region: RegionIndex, offset: u32) -> Result<RecordHeader, F::Error> {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        self.flash.read(region, offset, &mut buf).map_err(Error::Platform)?;
        Ok(RecordHeader::decode(&buf))
    }

    fn write_header(&mut self, region: RegionIndex, offset: u32, header: &RecordHeader) -> Result<(), F::Error> {
        self.flash.write(region, offset, &header.encode()).map_err(Error::Platform)
    }

    fn write_record(&mut self, region: RegionIndex, offset: u32, header: &RecordHeader, value: &[u8]) -> Result<(), F::Error> {
        let mut buf = [0xFFu8; RECORD_HEADER_SIZE + MAX_PAYLOAD];
        let size = record_size(header.length) as usize;
        buf[..RECORD_HEADER_SIZE].copy_from_slice(&header.encode());
        buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + value.len()].copy_from_slice(value);
        self.flash.write(region, offset, &buf[..size]).map_err(Error::Platform)
    }

    fn read_swap_marker(&mut self, region: RegionIndex) -> Result<Option<SwapMarker>, F::Error> {
        let mut buf = [0u8; SWAP_HEADER_SIZE as usize];
        self.flash.read(region, 0, &mut buf).map_err(Error::Platform)?;
        Ok(SwapMarker::decode(LittleEndian::read_u32(&buf)))
    }

    fn write_swap_marker(&mut self, region: RegionIndex, marker: SwapMarker) -> Result<(), F::Error> {
        self.flash.write(region, 0, &marker.encode()).map_err(Error::Platform)
    }
}

/// Iterator over a key's live chain, returned by [`Store::iter`].
///
/// Yields owned `([u8; MAX_PAYLOAD], u16)` pairs (buffer, valid length)
/// rather than borrowed slices, since this crate has no allocator to hand
/// out owned `Vec<u8>`s and the buffer would otherwise need to outlive each
/// `next()` call uniquely.
pub struct Iter<'a, F: Flash> {
    store: &'a mut Store<F>,
    key: u16,
    index: u16,
    done: bool,
}

impl<'a, F: Flash> Iterator for Iter<'a, F> {
    type Item = Result<([u8; MAX_PAYLOAD], u16), F::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = [0u8; MAX_PAYLOAD];
        match self.store.get(self.key, self.index, &mut buf) {
            Ok(len) => {
                self.index += 1;
                Some(Ok((buf, len)))
            }
            Err(Error::NotFound) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

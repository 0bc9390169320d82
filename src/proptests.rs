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

//! Property-based tests over the store's core invariants.

use proptest::collection::vec as pvec;
use proptest::prelude::*;

use crate::mock::MockFlash;
use crate::{Error, Store};

const REGION_SIZE: u32 = 1024;

fn payload() -> impl Strategy<Value = std::vec::Vec<u8>> {
    pvec(any::<u8>(), 0..64)
}

proptest! {
    /// Property 1: a value round-trips through `Set`/`Get(_, 0)`.
    #[test]
    fn round_trip(key: u16, value in payload()) {
        let mut store = Store::init(MockFlash::new(REGION_SIZE)).unwrap();
        store.set(key, &value).unwrap();
        let mut buf = [0u8; 64];
        let len = store.get(key, 0, &mut buf).unwrap();
        prop_assert_eq!(&buf[..len as usize], value.as_slice());
    }

    /// Property 2: `Add` preserves append order and ordinal indexing.
    #[test]
    fn append_ordering(key: u16, values in pvec(payload(), 1..6)) {
        let mut store = Store::init(MockFlash::new(REGION_SIZE)).unwrap();
        for v in &values {
            store.add(key, v).unwrap();
        }
        let mut buf = [0u8; 64];
        for (i, v) in values.iter().enumerate() {
            let len = store.get(key, i as u16, &mut buf).unwrap();
            prop_assert_eq!(&buf[..len as usize], v.as_slice());
        }
        prop_assert!(matches!(store.get(key, values.len() as u16, &mut buf), Err(Error::NotFound)));
    }

    /// Property 3: `Set` after a chain of `Add`s shadows the whole chain.
    #[test]
    fn set_shadows_chain(key: u16, a in payload(), b in payload(), c in payload()) {
        let mut store = Store::init(MockFlash::new(REGION_SIZE)).unwrap();
        store.add(key, &a).unwrap();
        store.add(key, &b).unwrap();
        store.set(key, &c).unwrap();

        let mut buf = [0u8; 64];
        let len = store.get(key, 0, &mut buf).unwrap();
        prop_assert_eq!(&buf[..len as usize], c.as_slice());
        prop_assert!(matches!(store.get(key, 1, &mut buf), Err(Error::NotFound)));
    }

    /// Property 4: deleting every record for a key makes it unreadable.
    #[test]
    fn delete_all_removes_key(key: u16, values in pvec(payload(), 1..6)) {
        let mut store = Store::init(MockFlash::new(REGION_SIZE)).unwrap();
        for v in &values {
            store.add(key, v).unwrap();
        }
        store.delete(key, None).unwrap();
        let mut buf = [0u8; 64];
        prop_assert!(matches!(store.get(key, 0, &mut buf), Err(Error::NotFound)));
    }

    /// Property 5: deleting one ordinal shifts later ordinals down, and
    /// leaves earlier ones untouched.
    #[test]
    fn delete_one_preserves_others(key: u16, values in pvec(payload(), 2..6), victim_idx in 0usize..5) {
        let mut store = Store::init(MockFlash::new(REGION_SIZE)).unwrap();
        let victim = victim_idx % values.len();
        for v in &values {
            store.add(key, v).unwrap();
        }
        store.delete(key, Some(victim as u16)).unwrap();

        let mut buf = [0u8; 64];
        let mut expected = values.clone();
        expected.remove(victim);
        for (i, v) in expected.iter().enumerate() {
            let len = store.get(key, i as u16, &mut buf).unwrap();
            prop_assert_eq!(&buf[..len as usize], v.as_slice());
        }
        prop_assert!(matches!(store.get(key, expected.len() as u16, &mut buf), Err(Error::NotFound)));
    }

    /// Property 8: the frontier stays word-aligned after any sequence of
    /// mutating operations, including ones that force compaction.
    #[test]
    fn frontier_stays_aligned(values in pvec((any::<u16>(), payload()), 0..20)) {
        let mut store = Store::init(MockFlash::new(REGION_SIZE)).unwrap();
        for (key, value) in &values {
            // Ignore NoSpace: this property is about alignment, not capacity.
            let _ = store.set(*key, value);
        }
        prop_assert_eq!(store.swap_used() % crate::layout::WORD_SIZE, 0);
    }

    /// Property 9: wiping twice in a row is idempotent and forgets every key.
    #[test]
    fn wipe_idempotence(values in pvec((any::<u16>(), payload()), 0..10)) {
        let mut store = Store::init(MockFlash::new(REGION_SIZE)).unwrap();
        for (key, value) in &values {
            let _ = store.set(*key, value);
        }
        store.wipe().unwrap();
        store.wipe().unwrap();
        let mut buf = [0u8; 64];
        for (key, _) in &values {
            prop_assert!(matches!(store.get(*key, 0, &mut buf), Err(Error::NotFound)));
        }
    }

    /// Property 7 (crash safety, narrow form): replaying any prefix of the
    /// flash writes made by a single `Add` and then recovering must not
    /// corrupt previously-committed keys.
    #[test]
    fn crash_during_add_preserves_prior_keys(first in payload(), second in payload()) {
        let mut store = Store::init(MockFlash::new(REGION_SIZE)).unwrap();
        store.set(0xAAAA, &first).unwrap();
        store.set(0xBBBB, &second).unwrap();

        let flash = store.into_flash();
        let total = flash.log().len();
        for prefix in 0..=total {
            let crashed = flash.replay_prefix(prefix);
            // `init` itself must never panic or loop, for any prefix.
            let mut recovered = match Store::init(crashed) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let mut buf = [0u8; 64];
            // 0xAAAA was fully committed before 0xBBBB's write began, so it
            // must survive every possible truncation point.
            let len = recovered.get(0xAAAA, 0, &mut buf);
            prop_assert!(len.is_ok());
            prop_assert_eq!(&buf[..len.unwrap() as usize], first.as_slice());
        }
    }
}

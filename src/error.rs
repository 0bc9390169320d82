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

//! The store's error type.

/// Errors returned by [`crate::Store`] operations.
///
/// `NotFound` and `NoSpace` are the only logical failures a caller needs to
/// handle. Everything else -- torn writes, a non-erased tail, a misaligned
/// frontier -- is recovered from transparently during `Store::init` and
/// never reaches the caller as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<E> {
    /// `get`/`delete` found no record (at the requested index) for the key.
    NotFound,
    /// `add`/`set` could not fit the record even after a compaction attempt.
    NoSpace,
    /// The underlying [`crate::Flash`] implementation reported a fault.
    ///
    /// The in-flight operation aborted; this cannot have left the
    /// flag-monotonicity invariant violated, because every multi-step write
    /// sequence only ever performs further 1-bit clears and never depends on
    /// the platform having observed an earlier step in the same call.
    Platform(E),
}

impl<E: core::fmt::Debug> core::fmt::Display for Error<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NotFound => write!(f, "key/index not found"),
            Error::NoSpace => write!(f, "no space left in either swap region"),
            Error::Platform(e) => write!(f, "flash platform error: {:?}", e),
        }
    }
}

pub(crate) type Result<T, E> = core::result::Result<T, Error<E>>;

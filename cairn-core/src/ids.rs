//! Time-sortable identifiers
//!
//! An id is `n = millis * COUNTER_MODULUS + counter` as 8 big-endian bytes in
//! the sort-preserving base32 alphabet (13 symbols), a one-symbol format tag,
//! and an optional 13-symbol suffix carrying random bytes or a truncated hash
//! of a caller-supplied seed.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::base32::{self, SORTABLE};
use crate::error::{Error, Result};

/// Ids created within one millisecond are distinguished by a counter below this.
pub const COUNTER_MODULUS: u64 = 1000;

/// Length of the timestamp block.
pub const TIME_BLOCK_LEN: usize = base32::encoded_len(8);

/// Length of the suffix block.
pub const SUFFIX_LEN: usize = base32::encoded_len(8);

/// Source of wall-clock time in milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// What follows the timestamp block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFormat {
    /// Timestamp only
    Bare,
    /// Eight random bytes
    Random,
    /// First eight bytes of sha256 over a seed string
    Hashed,
}

impl IdFormat {
    fn tag(self) -> char {
        match self {
            IdFormat::Bare => '0',
            IdFormat::Random => '1',
            IdFormat::Hashed => '2',
        }
    }

    fn from_tag(tag: char) -> Option<Self> {
        match tag {
            '0' => Some(IdFormat::Bare),
            '1' => Some(IdFormat::Random),
            '2' => Some(IdFormat::Hashed),
            _ => None,
        }
    }
}

/// Fields recovered from an id string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedId {
    pub millis: u64,
    pub counter: u64,
    pub format: IdFormat,
    pub suffix: Option<[u8; 8]>,
}

impl DecodedId {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.millis as i64)
    }
}

/// Split an id back into its parts
pub fn decode(id: &str) -> Result<DecodedId> {
    let invalid = || Error::InvalidId(id.to_string());
    if !id.is_ascii() || id.len() < TIME_BLOCK_LEN + 1 {
        return Err(invalid());
    }
    let (time_block, rest) = id.split_at(TIME_BLOCK_LEN);
    let mut chars = rest.chars();
    let format = chars.next().and_then(IdFormat::from_tag).ok_or_else(invalid)?;
    let suffix_block = chars.as_str();

    let bytes = base32::decode(SORTABLE, time_block).ok_or_else(invalid)?;
    let n = u64::from_be_bytes(bytes.try_into().map_err(|_| invalid())?);

    let suffix = match format {
        IdFormat::Bare if suffix_block.is_empty() => None,
        IdFormat::Random | IdFormat::Hashed if suffix_block.len() == SUFFIX_LEN => {
            let bytes = base32::decode(SORTABLE, suffix_block).ok_or_else(invalid)?;
            Some(bytes.try_into().map_err(|_| invalid())?)
        }
        _ => return Err(invalid()),
    };

    Ok(DecodedId {
        millis: n / COUNTER_MODULUS,
        counter: n % COUNTER_MODULUS,
        format,
        suffix,
    })
}

#[derive(Debug, Default)]
struct GeneratorState {
    last: u64,
}

/// Per-process identifier generator with an injectable clock
pub struct IdGenerator {
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl IdGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    /// Current time from the generator's clock, millisecond precision
    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.clock.now_millis() as i64).unwrap_or_default()
    }

    /// Next value of `n`. Strictly increasing within this generator: when the
    /// clock stalls, goes backwards, or the counter would wrap inside one
    /// millisecond, `n` is bumped to `last + 1`.
    fn next_n(&self) -> u64 {
        let base = self.clock.now_millis().saturating_mul(COUNTER_MODULUS);
        // A poisoned lock only means another thread panicked mid-update of a
        // plain integer; the value is still usable.
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let n = if base > state.last { base } else { state.last + 1 };
        state.last = n;
        n
    }

    fn time_block(&self) -> String {
        base32::encode(SORTABLE, &self.next_n().to_be_bytes())
    }

    /// Id with no suffix
    pub fn bare(&self) -> String {
        let mut id = self.time_block();
        id.push(IdFormat::Bare.tag());
        id
    }

    /// Id with a random suffix, the default for revisions and entities
    pub fn create(&self) -> String {
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        self.with_suffix(IdFormat::Random, &suffix)
    }

    /// Id whose suffix is derived from `seed`, e.g. a source URI
    pub fn create_seeded(&self, seed: &str) -> String {
        let digest = Sha256::digest(seed.as_bytes());
        self.with_suffix(IdFormat::Hashed, &digest[..8])
    }

    fn with_suffix(&self, format: IdFormat, suffix: &[u8]) -> String {
        let mut id = self.time_block();
        id.push(format.tag());
        id.push_str(&base32::encode(SORTABLE, suffix));
        id
    }
}

/// Entity identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    /// Wrap an existing id, checking its shape
    pub fn parse(s: &str) -> Result<Self> {
        decode(s)?;
        Ok(Self(s.to_string()))
    }

    pub fn generate(ids: &IdGenerator) -> Self {
        Self(ids.create())
    }

    /// Deterministic uid for an entity first seen under `uri`
    pub fn from_uri(ids: &IdGenerator, uri: &str) -> Self {
        Self(ids.create_seeded(uri))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_trusted(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Uid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manual(millis: u64) -> (Arc<ManualClock>, IdGenerator) {
        let clock = Arc::new(ManualClock::new(millis));
        let ids = IdGenerator::new(clock.clone());
        (clock, ids)
    }

    #[test]
    fn test_decode_recovers_millis() {
        let (_, ids) = manual(1_714_564_800_123);
        let id = ids.create();
        let decoded = decode(&id).unwrap();
        assert_eq!(decoded.millis, 1_714_564_800_123);
        assert_eq!(decoded.counter, 0);
        assert_eq!(decoded.format, IdFormat::Random);
        assert_eq!(id.len(), TIME_BLOCK_LEN + 1 + SUFFIX_LEN);
    }

    #[test]
    fn test_same_millisecond_uses_counter() {
        let (_, ids) = manual(5_000);
        let a = ids.bare();
        let b = ids.bare();
        let c = ids.bare();
        assert!(a < b && b < c);
        assert_eq!(decode(&b).unwrap().counter, 1);
        assert_eq!(decode(&c).unwrap().millis, 5_000);
    }

    #[test]
    fn test_clock_going_backwards_stays_monotonic() {
        let (clock, ids) = manual(10_000);
        let a = ids.create();
        clock.set(9_000);
        let b = ids.create();
        assert!(a < b);
    }

    #[test]
    fn test_counter_wrap_spills_into_next_millisecond() {
        let (_, ids) = manual(42);
        let mut last = String::new();
        for _ in 0..COUNTER_MODULUS + 5 {
            let id = ids.bare();
            assert!(id > last);
            last = id;
        }
        let decoded = decode(&last).unwrap();
        assert_eq!(decoded.millis, 43);
        assert_eq!(decoded.counter, 4);
    }

    #[test]
    fn test_seeded_suffix_is_deterministic() {
        let (_, ids) = manual(1);
        let a = ids.create_seeded("https://example.org/a");
        let b = ids.create_seeded("https://example.org/a");
        assert_ne!(a, b);
        assert_eq!(a[TIME_BLOCK_LEN..], b[TIME_BLOCK_LEN..]);
        assert_eq!(decode(&a).unwrap().format, IdFormat::Hashed);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("").is_err());
        assert!(decode("short").is_err());
        assert!(decode("0000000000000").is_err());
        assert!(decode("00000000000009").is_err());
        assert!(decode("00000000000001abc").is_err());
        assert!(Uid::parse("not an id at all").is_err());
    }

    proptest! {
        #[test]
        fn prop_sequence_is_strictly_increasing(steps in proptest::collection::vec(0u64..3, 1..200)) {
            let (clock, ids) = manual(1_600_000_000_000);
            let mut previous: Option<String> = None;
            for step in steps {
                clock.advance(step);
                let id = ids.create();
                if let Some(prev) = &previous {
                    prop_assert!(id > *prev);
                }
                previous = Some(id);
            }
        }

        #[test]
        fn prop_decode_roundtrip(millis in 0u64..10_000_000_000_000) {
            let (_, ids) = manual(millis);
            let decoded = decode(&ids.create()).unwrap();
            prop_assert_eq!(decoded.millis, millis);
        }
    }
}

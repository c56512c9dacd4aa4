//! Known public-key fingerprints of a peer and their trust labels.
//!
//! A `FingerprintList` keeps entries most-recent-first. Entries are stored by
//! insertion sequence number, with a side index from fingerprint bytes to that
//! number, so lookup and removal never walk the list and never need a
//! predecessor fix-up.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::context::{try_copy_str, ContextError};

/// Fingerprint length in bytes (SHA-1 of the public key)
pub const FINGERPRINT_LEN: usize = 20;

/// Digest identifying one long-term public key of a peer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    #[must_use]
    pub const fn new(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl From<[u8; FINGERPRINT_LEN]> for Fingerprint {
    fn from(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Fingerprint {
    type Error = FingerprintParseError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; FINGERPRINT_LEN] = bytes
            .try_into()
            .map_err(|_| FingerprintParseError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

/// Human form: five groups of eight uppercase hex digits
impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode_upper(self.0);
        for (i, group) in hex.as_bytes().chunks(8).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            // chunks of an ASCII hex string are valid UTF-8
            f.write_str(std::str::from_utf8(group).map_err(|_| fmt::Error)?)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// Error parsing a fingerprint from text or bytes
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum FingerprintParseError {
    #[error("Invalid fingerprint length: {0} bytes")]
    InvalidLength(usize),
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Accepts the human form or plain hex, in either case
impl FromStr for Fingerprint {
    type Err = FingerprintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = hex::decode(compact)?;
        Self::try_from(bytes.as_slice())
    }
}

/// One known fingerprint of a peer plus its trust label
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FingerprintEntry {
    fingerprint: Fingerprint,
    trust: Option<String>,
}

impl FingerprintEntry {
    fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            trust: None,
        }
    }

    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The trust label, `None` meaning unverified
    #[must_use]
    pub fn trust(&self) -> Option<&str> {
        self.trust.as_deref()
    }

    /// Replace the trust label; `None` clears it.
    /// On `ResourceExhausted` the previous label is kept.
    pub fn set_trust(&mut self, trust: Option<&str>) -> Result<(), ContextError> {
        self.trust = trust
            .map(|label| try_copy_str(label, "trust label"))
            .transpose()?;
        Ok(())
    }
}

/// Fingerprints of one context, most recently added first
#[derive(Debug, Default)]
pub struct FingerprintList {
    /// Entries keyed by insertion sequence number
    by_age: BTreeMap<u64, FingerprintEntry>,
    /// Fingerprint bytes -> sequence number
    index: HashMap<Fingerprint, u64>,
    next_seq: u64,
}

impl FingerprintList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_age.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_age.is_empty()
    }

    #[must_use]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.index.contains_key(fingerprint)
    }

    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&FingerprintEntry> {
        let seq = self.index.get(fingerprint)?;
        self.by_age.get(seq)
    }

    pub fn get_mut(&mut self, fingerprint: &Fingerprint) -> Option<&mut FingerprintEntry> {
        let seq = self.index.get(fingerprint)?;
        self.by_age.get_mut(seq)
    }

    /// The most recently added entry
    #[must_use]
    pub fn first(&self) -> Option<&FingerprintEntry> {
        self.by_age.values().next_back()
    }

    /// Entries, most recently added first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &FingerprintEntry> + '_ {
        self.by_age.values().rev()
    }

    /// Find the entry for `fingerprint`, adding it at the front if missing.
    /// Returns the entry and whether it was just created.
    pub(crate) fn find_or_insert(&mut self, fingerprint: Fingerprint) -> (&mut FingerprintEntry, bool) {
        let (seq, created) = match self.index.get(&fingerprint) {
            Some(&seq) => (seq, false),
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.index.insert(fingerprint, seq);
                (seq, true)
            }
        };
        let entry = self
            .by_age
            .entry(seq)
            .or_insert_with(|| FingerprintEntry::new(fingerprint));
        (entry, created)
    }

    /// Unlink and return the entry for `fingerprint`
    pub(crate) fn remove(&mut self, fingerprint: &Fingerprint) -> Option<FingerprintEntry> {
        let seq = self.index.remove(fingerprint)?;
        self.by_age.remove(&seq)
    }

    /// Remove the most recently added entry
    pub(crate) fn pop_first(&mut self) -> Option<FingerprintEntry> {
        let (_, entry) = self.by_age.pop_last()?;
        self.index.remove(&entry.fingerprint);
        Some(entry)
    }
}

impl<'a> IntoIterator for &'a FingerprintList {
    type Item = &'a FingerprintEntry;
    type IntoIter = std::iter::Rev<std::collections::btree_map::Values<'a, u64, FingerprintEntry>>;

    fn into_iter(self) -> Self::IntoIter {
        self.by_age.values().rev()
    }
}

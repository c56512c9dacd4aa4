//! OTR Contexts - per-identity session and trust store
//!
//! This crate tracks, for every (peer, local account, protocol) identity of an
//! end-to-end encrypted conversation protocol:
//! - the connection state (`Unconnected`, `Setup`, `Connected`)
//! - the DH key pairs, remote public values and session keys in force
//! - every public-key fingerprint seen for the peer, with a trust label
//!
//! and decides what has to be wiped or destroyed as conversations move through
//! setup and teardown.
//!
//! ## Architecture
//!
//! ```text
//! ContextRegistry (ordered by username, accountname, protocol)
//!     │
//!     ├── Context "alice/me/xmpp"
//!     │     ├── state machine + key material (zeroized on release)
//!     │     ├── FingerprintList (most recent first)
//!     │     │     └── FingerprintEntry { fingerprint, trust }
//!     │     └── application data + release fn
//!     └── Context "bob/me/xmpp"
//!           └── ...
//! ```
//!
//! Key agreement, message encoding, SMP and persistence live elsewhere; this
//! crate only owns and releases the material they produce.
//!
//! ## Example
//!
//! ```
//! use otr_contexts::{ContextRegistry, Fingerprint, FingerprintSlot, Forgotten};
//!
//! let mut registry: ContextRegistry = ContextRegistry::new();
//! let (context, created) = registry
//!     .find_or_create("bob", "alice@example.org", "xmpp", |_| {})
//!     .unwrap();
//! assert!(created);
//!
//! let fingerprint = Fingerprint::new([0x42; 20]);
//! let (entry, _) = context.find_or_add_fingerprint(fingerprint).unwrap();
//! entry.set_trust(Some("verified")).unwrap();
//!
//! let id = context.id().clone();
//! let forgotten = registry
//!     .forget_fingerprint(&id, FingerprintSlot::Entry(fingerprint), true)
//!     .unwrap();
//! assert_eq!(forgotten, Forgotten::Context);
//! assert!(registry.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod fingerprint;
pub mod keys;
pub mod registry;

pub use config::{ContextLimits, RegistryConfig};
pub use context::{ConnectionState, Context, ContextError, ContextId, OfferState};
pub use fingerprint::{
    Fingerprint, FingerprintEntry, FingerprintList, FingerprintParseError, FINGERPRINT_LEN,
};
pub use keys::{
    DhKeypair, KeySlot, PublicValue, SessionKeys, CTR_LEN, ENC_KEY_LEN, MAC_KEY_LEN,
    SESSION_ID_LEN,
};
pub use registry::{ContextRegistry, FingerprintSlot, Forgotten};

#[cfg(feature = "wasm")]
mod wasm;

#[cfg(feature = "wasm")]
pub use wasm::*;

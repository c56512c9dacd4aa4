//! Conversation contexts and their connection state machine.
//!
//! A `Context` is everything we know about one (peer, local account, protocol)
//! identity: where the conversation is in its setup, the key material currently
//! in force, and every fingerprint ever seen for the peer.
//!
//! # State machine
//!
//! ```text
//!                 force_setup           mark_connected
//!   Unconnected ─────────────► Setup ─────────────────► Connected
//!        ▲                       ▲                          │
//!        │                       └──────── force_setup ─────┤
//!        └──────────────────── force_disconnect ────────────┘
//! ```
//!
//! Downgrades wipe material: `force_setup` drops everything learned from the
//! peer, `force_disconnect` additionally drops our own DH keys. Both are
//! idempotent and allowed from any state.
//!
//! # Security Properties
//!
//! - **Zeroize on release**: key pairs, session keys, the preshared secret,
//!   saved MAC keys and the last sent message are wiped when released
//! - **Active fingerprint pinning**: the fingerprint backing a `Connected`
//!   session cannot be forgotten

use std::fmt;

use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::config::ContextLimits;
use crate::fingerprint::{Fingerprint, FingerprintEntry, FingerprintList};
use crate::keys::{
    DhKeypair, KeySlot, PublicValue, SessionKeyMatrix, SessionKeys, MAC_KEY_LEN, SESSION_ID_LEN,
};

/// Connection state of a context
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No key material from the peer, no local DH keys
    #[default]
    Unconnected,
    /// Local DH keys only; key agreement in progress
    Setup,
    /// Encrypted session established
    Connected,
}

impl ConnectionState {
    /// Human readable description
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Unconnected => "Not private",
            ConnectionState::Setup => "Setting up",
            ConnectionState::Connected => "Private",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether we have offered an encrypted conversation to the peer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OfferState {
    #[default]
    NotOffered,
    Sent,
    Rejected,
    Accepted,
}

/// Error types for context operations
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("Missing identity field: {0}")]
    InvalidArgument(&'static str),
    #[error("Context is not unconnected (state: {0})")]
    NotUnconnected(ConnectionState),
    #[error("Fingerprint is active in a connected session")]
    FingerprintInUse,
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("Unknown context")]
    UnknownContext,
    #[error("Unknown fingerprint")]
    UnknownFingerprint,
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),
}

impl ContextError {
    /// True for refusals caused by the context's current state
    #[must_use]
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            ContextError::NotUnconnected(_)
                | ContextError::FingerprintInUse
                | ContextError::InvalidTransition { .. }
        )
    }
}

/// Copy a string without aborting on allocation failure
pub(crate) fn try_copy_str(s: &str, what: &'static str) -> Result<String, ContextError> {
    let mut out = String::new();
    out.try_reserve_exact(s.len())
        .map_err(|_| ContextError::ResourceExhausted(what))?;
    out.push_str(s);
    Ok(out)
}

/// Copy secret bytes into a buffer that is wiped on drop
fn try_copy_secret(bytes: &[u8], what: &'static str) -> Result<Zeroizing<Vec<u8>>, ContextError> {
    let mut out = Zeroizing::new(Vec::new());
    out.try_reserve_exact(bytes.len())
        .map_err(|_| ContextError::ResourceExhausted(what))?;
    out.extend_from_slice(bytes);
    Ok(out)
}

/// Identity of a context: peer username, local account name, protocol.
///
/// Ordering is lexicographic on the three fields in that order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId {
    username: String,
    accountname: String,
    protocol: String,
}

impl ContextId {
    /// Build an identity; every field must be non-empty
    pub fn new(username: &str, accountname: &str, protocol: &str) -> Result<Self, ContextError> {
        if username.is_empty() {
            return Err(ContextError::InvalidArgument("username"));
        }
        if accountname.is_empty() {
            return Err(ContextError::InvalidArgument("accountname"));
        }
        if protocol.is_empty() {
            return Err(ContextError::InvalidArgument("protocol"));
        }
        Ok(Self {
            username: try_copy_str(username, "username")?,
            accountname: try_copy_str(accountname, "accountname")?,
            protocol: try_copy_str(protocol, "protocol")?,
        })
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn accountname(&self) -> &str {
        &self.accountname
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.username, self.accountname, self.protocol)
    }
}

/// Per-identity conversation state
pub struct Context<A = ()> {
    id: ContextId,
    state: ConnectionState,
    limits: ContextLimits,

    fingerprints: FingerprintList,
    /// Only meaningful while `Connected`
    active_fingerprint: Option<Fingerprint>,

    their_keyid: u32,
    their_y: Option<PublicValue>,
    their_old_y: Option<PublicValue>,
    our_keyid: u32,
    our_dh_key: Option<DhKeypair>,
    our_old_dh_key: Option<DhKeypair>,
    session_keys: SessionKeyMatrix,
    session_id: [u8; SESSION_ID_LEN],

    /// Used MAC keys kept for revealing later
    num_saved_keys: usize,
    saved_mac_keys: Option<Zeroizing<Vec<u8>>>,

    preshared_secret: Option<Zeroizing<Vec<u8>>>,

    generation: u32,
    last_sent: u64,
    last_message: Option<Zeroizing<Vec<u8>>>,
    may_retransmit: bool,
    otr_offer: OfferState,

    app_data: Option<A>,
    app_data_free: Option<fn(A)>,
}

impl<A> Context<A> {
    /// Fresh context in the fully reset `Unconnected` state
    pub(crate) fn new(id: ContextId, limits: ContextLimits) -> Self {
        Self {
            id,
            state: ConnectionState::Unconnected,
            limits,
            fingerprints: FingerprintList::new(),
            active_fingerprint: None,
            their_keyid: 0,
            their_y: None,
            their_old_y: None,
            our_keyid: 0,
            our_dh_key: None,
            our_old_dh_key: None,
            session_keys: SessionKeyMatrix::default(),
            session_id: [0u8; SESSION_ID_LEN],
            num_saved_keys: 0,
            saved_mac_keys: None,
            preshared_secret: None,
            generation: 0,
            last_sent: 0,
            last_message: None,
            may_retransmit: false,
            otr_offer: OfferState::NotOffered,
            app_data: None,
            app_data_free: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ContextId {
        &self.id
    }

    #[must_use]
    pub fn username(&self) -> &str {
        self.id.username()
    }

    #[must_use]
    pub fn accountname(&self) -> &str {
        self.id.accountname()
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        self.id.protocol()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    // ============================================================
    // FINGERPRINTS
    // ============================================================

    /// All known fingerprints, most recently added first
    #[must_use]
    pub fn fingerprints(&self) -> &FingerprintList {
        &self.fingerprints
    }

    #[must_use]
    pub fn find_fingerprint(&self, fingerprint: &Fingerprint) -> Option<&FingerprintEntry> {
        self.fingerprints.get(fingerprint)
    }

    pub fn find_fingerprint_mut(&mut self, fingerprint: &Fingerprint) -> Option<&mut FingerprintEntry> {
        self.fingerprints.get_mut(fingerprint)
    }

    /// Find a fingerprint, adding it (untrusted, at the front) if missing.
    /// Returns the entry and whether it was just created.
    pub fn find_or_add_fingerprint(
        &mut self,
        fingerprint: Fingerprint,
    ) -> Result<(&mut FingerprintEntry, bool), ContextError> {
        if !self.fingerprints.contains(&fingerprint) {
            if self.fingerprints.len() >= self.limits.max_fingerprints {
                return Err(ContextError::ResourceExhausted("fingerprint list is full"));
            }
            debug!(
                target: "contexts",
                context = %self.id,
                %fingerprint,
                "new fingerprint"
            );
        }
        Ok(self.fingerprints.find_or_insert(fingerprint))
    }

    /// Replace the trust label of a known fingerprint.
    /// Returns false if the fingerprint is unknown.
    pub fn set_trust(
        &mut self,
        fingerprint: &Fingerprint,
        trust: Option<&str>,
    ) -> Result<bool, ContextError> {
        match self.fingerprints.get_mut(fingerprint) {
            Some(entry) => {
                entry.set_trust(trust)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The fingerprint backing the live session, if `Connected`
    #[must_use]
    pub fn active_fingerprint(&self) -> Option<&FingerprintEntry> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.fingerprints.get(self.active_fingerprint.as_ref()?)
    }

    /// Remove one fingerprint. Refused for the active fingerprint of a
    /// `Connected` context.
    pub fn forget_fingerprint(&mut self, fingerprint: &Fingerprint) -> Result<(), ContextError> {
        if self.state == ConnectionState::Connected
            && self.active_fingerprint.as_ref() == Some(fingerprint)
        {
            warn!(
                target: "contexts",
                context = %self.id,
                %fingerprint,
                "refusing to forget the active fingerprint"
            );
            return Err(ContextError::FingerprintInUse);
        }

        self.fingerprints
            .remove(fingerprint)
            .ok_or(ContextError::UnknownFingerprint)?;
        if self.active_fingerprint.as_ref() == Some(fingerprint) {
            self.active_fingerprint = None;
        }
        Ok(())
    }

    // ============================================================
    // STATE MACHINE
    // ============================================================

    /// Enter `Connected` with `fingerprint` backing the session.
    /// Allowed from `Setup`, or from `Connected` to switch keys.
    pub fn mark_connected(&mut self, fingerprint: &Fingerprint) -> Result<(), ContextError> {
        if self.state == ConnectionState::Unconnected {
            return Err(ContextError::InvalidTransition {
                from: self.state,
                to: ConnectionState::Connected,
            });
        }
        if !self.fingerprints.contains(fingerprint) {
            return Err(ContextError::UnknownFingerprint);
        }

        self.active_fingerprint = Some(*fingerprint);
        self.state = ConnectionState::Connected;
        debug!(target: "contexts", context = %self.id, %fingerprint, "connected");
        Ok(())
    }

    /// Force the context into `Setup`, keeping only our own DH keys.
    pub fn force_setup(&mut self) {
        self.state = ConnectionState::Setup;
        self.active_fingerprint = None;

        self.their_keyid = 0;
        self.their_y = None;
        self.their_old_y = None;
        self.session_keys.release_all();
        self.session_id.zeroize();

        self.preshared_secret = None;
        self.num_saved_keys = 0;
        self.saved_mac_keys = None;

        self.last_message = None;
        self.may_retransmit = false;

        debug!(target: "contexts", context = %self.id, "forced to setup");
    }

    /// Force the context into `Unconnected`, dropping all key material.
    pub fn force_disconnect(&mut self) {
        self.force_setup();

        self.state = ConnectionState::Unconnected;
        self.our_keyid = 0;
        self.our_dh_key = None;
        self.our_old_dh_key = None;

        debug!(target: "contexts", context = %self.id, "forced to unconnected");
    }

    // ============================================================
    // KEY MATERIAL
    // ============================================================

    #[must_use]
    pub fn our_keyid(&self) -> u32 {
        self.our_keyid
    }

    #[must_use]
    pub fn their_keyid(&self) -> u32 {
        self.their_keyid
    }

    #[must_use]
    pub fn our_dh_key(&self) -> Option<&DhKeypair> {
        self.our_dh_key.as_ref()
    }

    #[must_use]
    pub fn our_old_dh_key(&self) -> Option<&DhKeypair> {
        self.our_old_dh_key.as_ref()
    }

    /// Install a new local key pair; the current one becomes the previous
    /// one and the oldest is released.
    pub fn rotate_our_dh_key(&mut self, keypair: DhKeypair) {
        self.our_old_dh_key = self.our_dh_key.replace(keypair);
        self.our_keyid = self.our_keyid.wrapping_add(1);
    }

    #[must_use]
    pub fn their_public(&self) -> Option<&PublicValue> {
        self.their_y.as_ref()
    }

    #[must_use]
    pub fn their_old_public(&self) -> Option<&PublicValue> {
        self.their_old_y.as_ref()
    }

    /// Record the peer's new public value under `keyid`; the current one
    /// becomes the previous one.
    pub fn accept_their_public(&mut self, keyid: u32, public: PublicValue) {
        self.their_old_y = self.their_y.replace(public);
        self.their_keyid = keyid;
    }

    #[must_use]
    pub fn session_keys(&self, ours: KeySlot, theirs: KeySlot) -> Option<&SessionKeys> {
        self.session_keys.get(ours, theirs)
    }

    pub fn session_keys_mut(&mut self, ours: KeySlot, theirs: KeySlot) -> Option<&mut SessionKeys> {
        self.session_keys.get_mut(ours, theirs)
    }

    /// Fill or release one session key slot. MAC keys that were used in the
    /// replaced keys are retained for revealing.
    ///
    /// Room for the retained keys is claimed before the slot changes, so a
    /// `ResourceExhausted` error leaves the slot and the saved keys untouched.
    pub fn set_session_keys(
        &mut self,
        ours: KeySlot,
        theirs: KeySlot,
        keys: Option<SessionKeys>,
    ) -> Result<(), ContextError> {
        let retired = match self.session_keys.get(ours, theirs) {
            Some(old) => old.used_mac_keys(),
            None => Zeroizing::new(Vec::new()),
        };
        if !retired.is_empty() {
            let saved = self.reserve_saved_mac_keys(retired.len())?;
            for mac_key in retired.iter() {
                saved.extend_from_slice(mac_key);
            }
            self.num_saved_keys += retired.len();
        }

        self.session_keys.replace(ours, theirs, keys);
        Ok(())
    }

    #[must_use]
    pub fn session_id(&self) -> &[u8; SESSION_ID_LEN] {
        &self.session_id
    }

    pub fn set_session_id(&mut self, session_id: [u8; SESSION_ID_LEN]) {
        self.session_id = session_id;
    }

    /// Retain a used MAC key so it can be revealed later
    pub fn save_mac_key(&mut self, mac_key: &[u8; MAC_KEY_LEN]) -> Result<(), ContextError> {
        self.reserve_saved_mac_keys(1)?.extend_from_slice(mac_key);
        self.num_saved_keys += 1;
        Ok(())
    }

    /// Check the limit and reserve space for `count` more MAC keys
    fn reserve_saved_mac_keys(&mut self, count: usize) -> Result<&mut Zeroizing<Vec<u8>>, ContextError> {
        let saved_len = self.saved_mac_keys.as_ref().map_or(0, |keys| keys.len());
        let needed = count * MAC_KEY_LEN;
        if saved_len + needed > self.limits.max_saved_mac_keys_len {
            return Err(ContextError::ResourceExhausted("saved MAC key buffer is full"));
        }

        let saved = self
            .saved_mac_keys
            .get_or_insert_with(|| Zeroizing::new(Vec::new()));
        saved
            .try_reserve(needed)
            .map_err(|_| ContextError::ResourceExhausted("saved MAC keys"))?;
        Ok(saved)
    }

    #[must_use]
    pub fn num_saved_keys(&self) -> usize {
        self.num_saved_keys
    }

    /// Concatenated saved MAC keys
    #[must_use]
    pub fn saved_mac_keys(&self) -> &[u8] {
        self.saved_mac_keys
            .as_deref()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Hand the saved MAC keys to the caller for revealing and reset the buffer
    pub fn take_saved_mac_keys(&mut self) -> Zeroizing<Vec<u8>> {
        self.num_saved_keys = 0;
        self.saved_mac_keys
            .take()
            .unwrap_or_else(|| Zeroizing::new(Vec::new()))
    }

    // ============================================================
    // PRESHARED SECRET
    // ============================================================

    /// Replace the preshared secret; `None` or empty clears it.
    /// Does not change the connection state.
    pub fn set_preshared_secret(&mut self, secret: Option<&[u8]>) -> Result<(), ContextError> {
        self.preshared_secret = None;

        let Some(secret) = secret.filter(|s| !s.is_empty()) else {
            return Ok(());
        };
        if secret.len() > self.limits.max_preshared_secret_len {
            return Err(ContextError::ResourceExhausted("preshared secret too long"));
        }
        self.preshared_secret = Some(try_copy_secret(secret, "preshared secret")?);
        Ok(())
    }

    #[must_use]
    pub fn preshared_secret(&self) -> Option<&[u8]> {
        self.preshared_secret.as_deref().map(Vec::as_slice)
    }

    // ============================================================
    // CONVERSATION BOOKKEEPING
    // ============================================================

    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Start a new generation (e.g. after a fresh key agreement)
    pub fn bump_generation(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    /// Timestamp (seconds) of the last sent message
    #[must_use]
    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }

    #[must_use]
    pub fn last_message(&self) -> Option<&[u8]> {
        self.last_message.as_deref().map(Vec::as_slice)
    }

    #[must_use]
    pub fn may_retransmit(&self) -> bool {
        self.may_retransmit
    }

    /// Remember the last sent message for possible retransmission
    pub fn set_last_message(
        &mut self,
        message: &[u8],
        sent_at: u64,
        may_retransmit: bool,
    ) -> Result<(), ContextError> {
        self.last_message = Some(try_copy_secret(message, "last message")?);
        self.last_sent = sent_at;
        self.may_retransmit = may_retransmit;
        Ok(())
    }

    #[must_use]
    pub fn otr_offer(&self) -> OfferState {
        self.otr_offer
    }

    pub fn set_otr_offer(&mut self, offer: OfferState) {
        self.otr_offer = offer;
    }

    // ============================================================
    // APPLICATION DATA
    // ============================================================

    #[must_use]
    pub fn app_data(&self) -> Option<&A> {
        self.app_data.as_ref()
    }

    pub fn app_data_mut(&mut self) -> Option<&mut A> {
        self.app_data.as_mut()
    }

    /// Attach application data and the function that releases it when the
    /// context is destroyed. Previously attached data is released first.
    pub fn set_app_data(&mut self, data: A, free: Option<fn(A)>) {
        self.release_app_data();
        self.app_data = Some(data);
        self.app_data_free = free;
    }

    fn release_app_data(&mut self) {
        let free = self.app_data_free.take();
        if let (Some(data), Some(free)) = (self.app_data.take(), free) {
            free(data);
        }
    }

    /// Tear the context down. The caller has already unlinked it.
    pub(crate) fn destroy(mut self) {
        self.force_disconnect();
        while self.fingerprints.pop_first().is_some() {}
        self.release_app_data();
        debug!(target: "contexts", context = %self.id, "context destroyed");
    }
}

impl<A> fmt::Debug for Context<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("fingerprints", &self.fingerprints.len())
            .field("active_fingerprint", &self.active_fingerprint)
            .field("our_keyid", &self.our_keyid)
            .field("their_keyid", &self.their_keyid)
            .field("has_session_keys", &!self.session_keys.is_empty())
            .finish_non_exhaustive()
    }
}

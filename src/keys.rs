//! Key material held by a conversation context.
//!
//! The Diffie-Hellman math, key generation and big-integer arithmetic live
//! outside this crate. The types here only own the resulting bytes so a context
//! can keep them, hand them back to the protocol driver, and wipe them.
//!
//! # Security Properties
//!
//! - **Zeroize on drop**: `DhKeypair`, `PublicValue` and `SessionKeys` derive
//!   `ZeroizeOnDrop`; releasing a slot (`Option::take`) wipes it
//! - **Redacted debug output**: secret-bearing types never print key bytes

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Session id length in bytes
pub const SESSION_ID_LEN: usize = 20;

/// Length of a SHA-1 MAC key
pub const MAC_KEY_LEN: usize = 20;

/// Length of an AES-128 encryption key
pub const ENC_KEY_LEN: usize = 16;

/// Length of the top half of an AES-CTR counter
pub const CTR_LEN: usize = 8;

/// A negotiated public value (big-endian MPI bytes)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PublicValue(Vec<u8>);

impl PublicValue {
    /// Wrap big-endian bytes
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PublicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicValue({} bytes)", self.0.len())
    }
}

/// Our Diffie-Hellman key pair
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhKeypair {
    group_id: u32,
    private: Vec<u8>,
    public: PublicValue,
}

impl DhKeypair {
    #[must_use]
    pub fn new(group_id: u32, private: Vec<u8>, public: PublicValue) -> Self {
        Self {
            group_id,
            private,
            public,
        }
    }

    #[must_use]
    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    #[must_use]
    pub fn public(&self) -> &PublicValue {
        &self.public
    }

    /// Private exponent bytes, for the key-agreement driver only
    #[must_use]
    pub fn private_bytes(&self) -> &[u8] {
        &self.private
    }
}

impl fmt::Debug for DhKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeypair")
            .field("group_id", &self.group_id)
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Symmetric keys derived for one (our key, their key) pair
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    send_enc: [u8; ENC_KEY_LEN],
    recv_enc: [u8; ENC_KEY_LEN],
    send_mac: [u8; MAC_KEY_LEN],
    recv_mac: [u8; MAC_KEY_LEN],
    send_ctr: [u8; CTR_LEN],
    recv_ctr: [u8; CTR_LEN],
    send_mac_used: bool,
    recv_mac_used: bool,
}

impl SessionKeys {
    /// Fresh keys with zeroed counters and unused MAC keys
    #[must_use]
    pub fn new(
        send_enc: [u8; ENC_KEY_LEN],
        recv_enc: [u8; ENC_KEY_LEN],
        send_mac: [u8; MAC_KEY_LEN],
        recv_mac: [u8; MAC_KEY_LEN],
    ) -> Self {
        Self {
            send_enc,
            recv_enc,
            send_mac,
            recv_mac,
            send_ctr: [0u8; CTR_LEN],
            recv_ctr: [0u8; CTR_LEN],
            send_mac_used: false,
            recv_mac_used: false,
        }
    }

    #[must_use]
    pub fn send_enc(&self) -> &[u8; ENC_KEY_LEN] {
        &self.send_enc
    }

    #[must_use]
    pub fn recv_enc(&self) -> &[u8; ENC_KEY_LEN] {
        &self.recv_enc
    }

    /// Sending MAC key; marks it as used
    pub fn use_send_mac(&mut self) -> &[u8; MAC_KEY_LEN] {
        self.send_mac_used = true;
        &self.send_mac
    }

    /// Receiving MAC key; marks it as used
    pub fn use_recv_mac(&mut self) -> &[u8; MAC_KEY_LEN] {
        self.recv_mac_used = true;
        &self.recv_mac
    }

    #[must_use]
    pub fn send_ctr(&self) -> &[u8; CTR_LEN] {
        &self.send_ctr
    }

    #[must_use]
    pub fn recv_ctr(&self) -> &[u8; CTR_LEN] {
        &self.recv_ctr
    }

    /// Increment the sending counter (big-endian) and return it
    pub fn next_send_ctr(&mut self) -> [u8; CTR_LEN] {
        for byte in self.send_ctr.iter_mut().rev() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
        self.send_ctr
    }

    /// Record the peer's counter after accepting a message
    pub fn set_recv_ctr(&mut self, ctr: [u8; CTR_LEN]) {
        self.recv_ctr = ctr;
    }

    /// MAC keys that were used and may be revealed once this slot is retired.
    /// The copies are wiped when the returned buffer is dropped.
    #[must_use]
    pub fn used_mac_keys(&self) -> Zeroizing<Vec<[u8; MAC_KEY_LEN]>> {
        let mut keys = Zeroizing::new(Vec::with_capacity(2));
        if self.send_mac_used {
            keys.push(self.send_mac);
        }
        if self.recv_mac_used {
            keys.push(self.recv_mac);
        }
        keys
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("send_mac_used", &self.send_mac_used)
            .field("recv_mac_used", &self.recv_mac_used)
            .finish_non_exhaustive()
    }
}

/// Which generation of a key a session slot belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeySlot {
    Current,
    Previous,
}

impl KeySlot {
    fn index(self) -> usize {
        match self {
            KeySlot::Current => 0,
            KeySlot::Previous => 1,
        }
    }
}

/// 2x2 matrix of session keys indexed by (our key, their key)
#[derive(Default)]
pub(crate) struct SessionKeyMatrix([[Option<SessionKeys>; 2]; 2]);

impl SessionKeyMatrix {
    pub(crate) fn get(&self, ours: KeySlot, theirs: KeySlot) -> Option<&SessionKeys> {
        self.0[ours.index()][theirs.index()].as_ref()
    }

    pub(crate) fn get_mut(&mut self, ours: KeySlot, theirs: KeySlot) -> Option<&mut SessionKeys> {
        self.0[ours.index()][theirs.index()].as_mut()
    }

    /// Put `keys` in the slot and hand back what was there
    pub(crate) fn replace(
        &mut self,
        ours: KeySlot,
        theirs: KeySlot,
        keys: Option<SessionKeys>,
    ) -> Option<SessionKeys> {
        std::mem::replace(&mut self.0[ours.index()][theirs.index()], keys)
    }

    /// Release every slot (dropping wipes the keys)
    pub(crate) fn release_all(&mut self) {
        for row in self.0.iter_mut() {
            for slot in row.iter_mut() {
                slot.take();
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.iter().flatten().all(Option::is_none)
    }
}

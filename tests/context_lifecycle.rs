//! Context lifecycle tests
//!
//! Drives single contexts through setup, connection and teardown the way a
//! messaging client would, checking what is kept and what is wiped at each
//! step.
//!
//! Test categories:
//! 1. Conversation Flow
//! 2. Forced Transitions
//! 3. Preshared Secret
//! 4. Limits
//! 5. Application Data

use otr_contexts::*;
use std::sync::atomic::{AtomicUsize, Ordering};

const SECRET: &[u8] = b"correct horse battery staple";

fn fp(byte: u8) -> Fingerprint {
    Fingerprint::new([byte; FINGERPRINT_LEN])
}

fn keypair(seed: u8) -> DhKeypair {
    DhKeypair::new(5, vec![seed; 32], PublicValue::from_bytes(&[seed.wrapping_add(1); 192]))
}

fn session_keys(seed: u8) -> SessionKeys {
    SessionKeys::new(
        [seed; ENC_KEY_LEN],
        [seed ^ 0xFF; ENC_KEY_LEN],
        [seed; MAC_KEY_LEN],
        [seed ^ 0xFF; MAC_KEY_LEN],
    )
}

/// Walk a context into `Connected` with material in every field
fn establish(ctx: &mut Context<u32>, peer: Fingerprint) {
    ctx.find_or_add_fingerprint(peer).unwrap();
    ctx.force_setup();
    ctx.rotate_our_dh_key(keypair(1));
    ctx.rotate_our_dh_key(keypair(2));
    ctx.accept_their_public(7, PublicValue::from_bytes(&[0x70; 192]));
    ctx.accept_their_public(8, PublicValue::from_bytes(&[0x80; 192]));
    ctx.set_session_keys(KeySlot::Current, KeySlot::Current, Some(session_keys(3)))
        .unwrap();
    ctx.set_session_keys(KeySlot::Previous, KeySlot::Current, Some(session_keys(4)))
        .unwrap();
    ctx.set_session_id([0x5A; SESSION_ID_LEN]);
    ctx.set_preshared_secret(Some(SECRET)).unwrap();
    ctx.save_mac_key(&[0x11; MAC_KEY_LEN]).unwrap();
    ctx.set_last_message(b"?OTR:AAMD", 1_700_000_000, true).unwrap();
    ctx.bump_generation();
    ctx.set_otr_offer(OfferState::Accepted);
    ctx.mark_connected(&peer).unwrap();
}

fn assert_peer_material_wiped(ctx: &Context<u32>) {
    assert!(ctx.active_fingerprint().is_none());
    assert_eq!(ctx.their_keyid(), 0);
    assert!(ctx.their_public().is_none());
    assert!(ctx.their_old_public().is_none());
    for ours in [KeySlot::Current, KeySlot::Previous] {
        for theirs in [KeySlot::Current, KeySlot::Previous] {
            assert!(ctx.session_keys(ours, theirs).is_none());
        }
    }
    assert_eq!(ctx.session_id(), &[0u8; SESSION_ID_LEN]);
    assert!(ctx.preshared_secret().is_none());
    assert_eq!(ctx.num_saved_keys(), 0);
    assert!(ctx.saved_mac_keys().is_empty());
    assert!(ctx.last_message().is_none());
    assert!(!ctx.may_retransmit());
}

/// Readable state of a context, secrets included
#[derive(Debug, PartialEq)]
struct Snapshot {
    state: ConnectionState,
    active: Option<Fingerprint>,
    fingerprints: Vec<Fingerprint>,
    our_keyid: u32,
    our_keys: (Option<Vec<u8>>, Option<Vec<u8>>),
    their_keyid: u32,
    their_publics: (Option<Vec<u8>>, Option<Vec<u8>>),
    session_slots: Vec<bool>,
    session_id: [u8; SESSION_ID_LEN],
    preshared_secret: Option<Vec<u8>>,
    num_saved_keys: usize,
    saved_mac_keys: Vec<u8>,
    last_message: Option<Vec<u8>>,
    may_retransmit: bool,
    generation: u32,
    otr_offer: OfferState,
}

fn snapshot(ctx: &Context<u32>) -> Snapshot {
    let mut session_slots = Vec::new();
    for ours in [KeySlot::Current, KeySlot::Previous] {
        for theirs in [KeySlot::Current, KeySlot::Previous] {
            session_slots.push(ctx.session_keys(ours, theirs).is_some());
        }
    }
    Snapshot {
        state: ctx.state(),
        active: ctx.active_fingerprint().map(|e| *e.fingerprint()),
        fingerprints: ctx.fingerprints().iter().map(|e| *e.fingerprint()).collect(),
        our_keyid: ctx.our_keyid(),
        our_keys: (
            ctx.our_dh_key().map(|k| k.private_bytes().to_vec()),
            ctx.our_old_dh_key().map(|k| k.private_bytes().to_vec()),
        ),
        their_keyid: ctx.their_keyid(),
        their_publics: (
            ctx.their_public().map(|p| p.as_bytes().to_vec()),
            ctx.their_old_public().map(|p| p.as_bytes().to_vec()),
        ),
        session_slots,
        session_id: *ctx.session_id(),
        preshared_secret: ctx.preshared_secret().map(<[u8]>::to_vec),
        num_saved_keys: ctx.num_saved_keys(),
        saved_mac_keys: ctx.saved_mac_keys().to_vec(),
        last_message: ctx.last_message().map(<[u8]>::to_vec),
        may_retransmit: ctx.may_retransmit(),
        generation: ctx.generation(),
        otr_offer: ctx.otr_offer(),
    }
}

fn registry_with(user: &str) -> ContextRegistry<u32> {
    let mut registry = ContextRegistry::new();
    registry.find_or_create(user, "me@example.org", "xmpp", |_| {}).unwrap();
    registry
}

fn context<'a>(registry: &'a mut ContextRegistry<u32>, user: &str) -> &'a mut Context<u32> {
    registry
        .find_mut(user, "me@example.org", "xmpp")
        .unwrap()
        .unwrap()
}

// ============================================================
// 1. CONVERSATION FLOW
// ============================================================

mod conversation_flow {
    use super::*;

    /// Full setup populates every piece of state
    #[test]
    fn establish_connected_session() {
        let mut registry = registry_with("bob");
        let ctx = context(&mut registry, "bob");
        establish(ctx, fp(0xB0));

        assert_eq!(ctx.state(), ConnectionState::Connected);
        assert_eq!(ctx.state().to_string(), "Private");
        assert_eq!(ctx.active_fingerprint().map(|e| *e.fingerprint()), Some(fp(0xB0)));
        assert_eq!(ctx.our_keyid(), 2);
        assert_eq!(ctx.our_dh_key().unwrap().private_bytes(), &[2u8; 32][..]);
        assert_eq!(ctx.our_old_dh_key().unwrap().private_bytes(), &[1u8; 32][..]);
        assert_eq!(ctx.their_keyid(), 8);
        assert_eq!(ctx.their_public().unwrap().as_bytes(), &[0x80; 192][..]);
        assert_eq!(ctx.their_old_public().unwrap().as_bytes(), &[0x70; 192][..]);
        assert!(ctx.session_keys(KeySlot::Current, KeySlot::Current).is_some());
        assert!(ctx.session_keys(KeySlot::Current, KeySlot::Previous).is_none());
        assert_eq!(ctx.preshared_secret(), Some(SECRET));
        assert_eq!(ctx.last_sent(), 1_700_000_000);
        assert_eq!(ctx.last_message(), Some(&b"?OTR:AAMD"[..]));
    }

    /// Sending and receiving rotate counters and mark MAC keys used
    #[test]
    fn message_exchange_and_key_retirement() {
        let mut registry = registry_with("bob");
        let ctx = context(&mut registry, "bob");
        establish(ctx, fp(0xB0));
        let saved_before = ctx.num_saved_keys();

        let keys = ctx
            .session_keys_mut(KeySlot::Current, KeySlot::Current)
            .unwrap();
        assert_eq!(keys.next_send_ctr(), [0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(keys.next_send_ctr(), [0, 0, 0, 0, 0, 0, 0, 2]);
        keys.use_send_mac();
        keys.use_recv_mac();
        keys.set_recv_ctr([0, 0, 0, 0, 0, 0, 0, 9]);
        assert_eq!(keys.recv_ctr(), &[0, 0, 0, 0, 0, 0, 0, 9]);

        // Peer rotates: the retired slot hands over both MAC keys
        ctx.set_session_keys(KeySlot::Current, KeySlot::Current, Some(session_keys(9)))
            .unwrap();
        assert_eq!(ctx.num_saved_keys(), saved_before + 2);

        let revealed = ctx.take_saved_mac_keys();
        assert_eq!(revealed.len(), (saved_before + 2) * MAC_KEY_LEN);
        assert_eq!(&revealed[revealed.len() - 2 * MAC_KEY_LEN..][..MAC_KEY_LEN], &[3u8; MAC_KEY_LEN]);
        assert_eq!(ctx.num_saved_keys(), 0);
        assert!(ctx.saved_mac_keys().is_empty());
    }

    /// Unused keys are released without retaining anything
    #[test]
    fn releasing_unused_keys_saves_nothing() {
        let mut registry = registry_with("bob");
        let ctx = context(&mut registry, "bob");
        ctx.force_setup();
        ctx.set_session_keys(KeySlot::Current, KeySlot::Previous, Some(session_keys(1)))
            .unwrap();
        ctx.set_session_keys(KeySlot::Current, KeySlot::Previous, None)
            .unwrap();
        assert_eq!(ctx.num_saved_keys(), 0);
        assert!(ctx.session_keys(KeySlot::Current, KeySlot::Previous).is_none());
    }

    /// Reconnecting after a downgrade pins the new fingerprint
    #[test]
    fn reconnect_after_setup() {
        let mut registry = registry_with("bob");
        let ctx = context(&mut registry, "bob");
        establish(ctx, fp(1));

        ctx.force_setup();
        ctx.find_or_add_fingerprint(fp(2)).unwrap();
        ctx.mark_connected(&fp(2)).unwrap();

        assert_eq!(ctx.active_fingerprint().map(|e| *e.fingerprint()), Some(fp(2)));
        ctx.forget_fingerprint(&fp(1)).unwrap();
        assert_eq!(ctx.forget_fingerprint(&fp(2)), Err(ContextError::FingerprintInUse));
    }

    /// Connecting straight from `Unconnected` is refused
    #[test]
    fn connect_requires_setup() {
        let mut registry = registry_with("bob");
        let ctx = context(&mut registry, "bob");
        ctx.find_or_add_fingerprint(fp(1)).unwrap();

        let err = ctx.mark_connected(&fp(1)).unwrap_err();
        assert!(err.is_precondition_violation());
        assert_eq!(ctx.state(), ConnectionState::Unconnected);

        ctx.force_setup();
        assert_eq!(ctx.mark_connected(&fp(2)), Err(ContextError::UnknownFingerprint));
        assert_eq!(ctx.state(), ConnectionState::Setup);
    }
}

// ============================================================
// 2. FORCED TRANSITIONS
// ============================================================

mod forced_transitions {
    use super::*;

    /// force_setup from any state keeps our keys and fingerprints only
    #[test]
    fn force_setup_from_every_state() {
        for start in [
            ConnectionState::Unconnected,
            ConnectionState::Setup,
            ConnectionState::Connected,
        ] {
            let mut registry = registry_with("bob");
            let ctx = context(&mut registry, "bob");
            establish(ctx, fp(1));
            match start {
                ConnectionState::Unconnected => {
                    ctx.force_disconnect();
                    ctx.rotate_our_dh_key(keypair(4));
                }
                ConnectionState::Setup => ctx.force_setup(),
                ConnectionState::Connected => {}
            }

            ctx.force_setup();

            assert_eq!(ctx.state(), ConnectionState::Setup, "from {start:?}");
            assert_peer_material_wiped(ctx);
            assert!(ctx.our_dh_key().is_some(), "from {start:?}");
            assert_eq!(ctx.fingerprints().len(), 1);
            assert_eq!(ctx.generation(), 1, "generation is kept");
            assert_eq!(ctx.otr_offer(), OfferState::Accepted, "offer is kept");
        }
    }

    /// force_disconnect additionally drops our own keys
    #[test]
    fn force_disconnect_from_every_state() {
        for start in [
            ConnectionState::Unconnected,
            ConnectionState::Setup,
            ConnectionState::Connected,
        ] {
            let mut registry = registry_with("bob");
            let ctx = context(&mut registry, "bob");
            establish(ctx, fp(1));
            match start {
                ConnectionState::Unconnected => ctx.force_disconnect(),
                ConnectionState::Setup => ctx.force_setup(),
                ConnectionState::Connected => {}
            }

            ctx.force_disconnect();

            assert_eq!(ctx.state(), ConnectionState::Unconnected, "from {start:?}");
            assert_eq!(ctx.state().as_str(), "Not private");
            assert_peer_material_wiped(ctx);
            assert_eq!(ctx.our_keyid(), 0);
            assert!(ctx.our_dh_key().is_none());
            assert!(ctx.our_old_dh_key().is_none());
            assert_eq!(ctx.fingerprints().len(), 1, "fingerprints survive");
        }
    }

    /// Applying a forced transition twice equals applying it once
    #[test]
    fn forced_transitions_are_idempotent() {
        let mut registry = registry_with("bob");
        let ctx = context(&mut registry, "bob");
        establish(ctx, fp(1));

        ctx.force_setup();
        let once = snapshot(ctx);
        ctx.force_setup();
        assert_eq!(snapshot(ctx), once);

        ctx.force_disconnect();
        let once = snapshot(ctx);
        ctx.force_disconnect();
        assert_eq!(snapshot(ctx), once);
    }

    /// Setup then disconnect ends in the same state as disconnect alone
    #[test]
    fn setup_then_disconnect_equals_disconnect() {
        let mut registry = registry_with("bob");
        registry.find_or_create("carol", "me@example.org", "xmpp", |_| {}).unwrap();

        let direct = context(&mut registry, "bob");
        establish(direct, fp(1));
        direct.force_disconnect();
        let direct = snapshot(direct);

        let stepped = context(&mut registry, "carol");
        establish(stepped, fp(1));
        stepped.force_setup();
        stepped.force_disconnect();

        assert_eq!(snapshot(stepped), direct);
        assert!(direct.session_slots.iter().all(|held| !held));
        assert_eq!(direct.session_id, [0u8; SESSION_ID_LEN]);
        assert!(direct.preshared_secret.is_none());
        assert!(direct.saved_mac_keys.is_empty());
        assert!(direct.last_message.is_none());
    }

    /// A disconnected context can be forgotten; trust survives until then
    #[test]
    fn disconnect_then_forget() {
        let mut registry = registry_with("bob");
        let ctx = context(&mut registry, "bob");
        establish(ctx, fp(1));
        assert!(ctx.set_trust(&fp(1), Some("verified")).unwrap());
        let id = ctx.id().clone();

        assert!(registry.forget(&id).is_err());

        let ctx = registry.get_mut(&id).unwrap();
        ctx.force_disconnect();
        assert_eq!(ctx.find_fingerprint(&fp(1)).unwrap().trust(), Some("verified"));

        registry.forget(&id).unwrap();
        assert!(registry.is_empty());
    }
}

// ============================================================
// 3. PRESHARED SECRET
// ============================================================

mod preshared_secret {
    use super::*;

    /// Set, replace, clear, without touching the connection state
    #[test]
    fn set_replace_clear() {
        let mut registry = registry_with("bob");
        let ctx = context(&mut registry, "bob");

        ctx.set_preshared_secret(Some(SECRET)).unwrap();
        assert_eq!(ctx.preshared_secret(), Some(SECRET));
        assert_eq!(ctx.state(), ConnectionState::Unconnected);

        ctx.set_preshared_secret(Some(&b"other"[..])).unwrap();
        assert_eq!(ctx.preshared_secret(), Some(&b"other"[..]));

        ctx.set_preshared_secret(Some(&[][..])).unwrap();
        assert!(ctx.preshared_secret().is_none());

        ctx.set_preshared_secret(Some(SECRET)).unwrap();
        ctx.set_preshared_secret(None).unwrap();
        assert!(ctx.preshared_secret().is_none());
    }

    /// The secret does not survive a downgrade
    #[test]
    fn wiped_by_force_setup() {
        let mut registry = registry_with("bob");
        let ctx = context(&mut registry, "bob");
        ctx.set_preshared_secret(Some(SECRET)).unwrap();
        ctx.force_setup();
        assert!(ctx.preshared_secret().is_none());
    }
}

// ============================================================
// 4. LIMITS
// ============================================================

mod limits {
    use super::*;

    fn tiny_registry() -> ContextRegistry<u32> {
        let mut registry =
            ContextRegistry::with_config(RegistryConfig::with_limits(1, ContextLimits::TINY));
        registry.find_or_create("bob", "me@example.org", "xmpp", |_| {}).unwrap();
        registry
    }

    #[test]
    fn registry_full() {
        let mut registry = tiny_registry();
        let err = registry
            .find_or_create("carol", "me@example.org", "xmpp", |_| {})
            .unwrap_err();
        assert_eq!(err, ContextError::ResourceExhausted("context registry is full"));
        assert!(!err.is_precondition_violation());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn fingerprint_list_full() {
        let mut registry = tiny_registry();
        let ctx = context(&mut registry, "bob");
        ctx.find_or_add_fingerprint(fp(1)).unwrap();
        ctx.find_or_add_fingerprint(fp(2)).unwrap();

        assert!(matches!(
            ctx.find_or_add_fingerprint(fp(3)),
            Err(ContextError::ResourceExhausted(_))
        ));
        // Known fingerprints are still found
        assert!(!ctx.find_or_add_fingerprint(fp(1)).unwrap().1);
        assert_eq!(ctx.fingerprints().len(), 2);
    }

    #[test]
    fn oversized_secret_leaves_none() {
        let mut registry = tiny_registry();
        let ctx = context(&mut registry, "bob");
        ctx.set_preshared_secret(Some(&b"short"[..])).unwrap();

        let long = [0x42u8; 17];
        assert!(matches!(
            ctx.set_preshared_secret(Some(&long[..])),
            Err(ContextError::ResourceExhausted(_))
        ));
        assert!(ctx.preshared_secret().is_none());
    }

    /// A key replacement that cannot retain the old MAC keys is refused whole
    #[test]
    fn refused_key_replacement_keeps_old_keys() {
        let mut registry = tiny_registry();
        let ctx = context(&mut registry, "bob");
        ctx.save_mac_key(&[0x11; MAC_KEY_LEN]).unwrap();
        ctx.set_session_keys(KeySlot::Current, KeySlot::Current, Some(session_keys(5)))
            .unwrap();
        let keys = ctx
            .session_keys_mut(KeySlot::Current, KeySlot::Current)
            .unwrap();
        keys.use_send_mac();
        keys.use_recv_mac();
        let before = snapshot(ctx);

        let result = ctx.set_session_keys(KeySlot::Current, KeySlot::Current, Some(session_keys(6)));

        assert_eq!(result, Err(ContextError::ResourceExhausted("saved MAC key buffer is full")));
        assert_eq!(snapshot(ctx), before);
        let kept = ctx.session_keys(KeySlot::Current, KeySlot::Current).unwrap();
        assert_eq!(kept.send_enc(), &[5u8; ENC_KEY_LEN]);
        assert_eq!(ctx.num_saved_keys(), 1);
    }

    #[test]
    fn saved_mac_buffer_full() {
        let mut registry = tiny_registry();
        let ctx = context(&mut registry, "bob");
        ctx.save_mac_key(&[1; MAC_KEY_LEN]).unwrap();
        ctx.save_mac_key(&[2; MAC_KEY_LEN]).unwrap();
        assert!(matches!(
            ctx.save_mac_key(&[3; MAC_KEY_LEN]),
            Err(ContextError::ResourceExhausted(_))
        ));
        assert_eq!(ctx.num_saved_keys(), 2);
    }
}

// ============================================================
// 5. APPLICATION DATA
// ============================================================

mod application_data {
    use super::*;

    static RELEASED_TOTAL: AtomicUsize = AtomicUsize::new(0);

    fn release(value: u32) {
        RELEASED_TOTAL.fetch_add(value as usize, Ordering::SeqCst);
    }

    /// Release function runs for replaced data and on destruction, once each
    #[test]
    fn release_runs_exactly_once_per_value() {
        let mut registry: ContextRegistry<u32> = ContextRegistry::new();
        registry
            .find_or_create("bob", "me@example.org", "xmpp", |ctx| ctx.set_app_data(100, Some(release)))
            .unwrap();

        let ctx = context(&mut registry, "bob");
        assert_eq!(ctx.app_data(), Some(&100));
        *ctx.app_data_mut().unwrap() += 1;
        ctx.set_app_data(20, Some(release));
        assert_eq!(RELEASED_TOTAL.load(Ordering::SeqCst), 101);

        // Transitions keep application data
        ctx.force_setup();
        ctx.force_disconnect();
        assert_eq!(ctx.app_data(), Some(&20));
        let id = ctx.id().clone();

        registry.forget(&id).unwrap();
        assert_eq!(RELEASED_TOTAL.load(Ordering::SeqCst), 121);

        drop(registry);
        assert_eq!(RELEASED_TOTAL.load(Ordering::SeqCst), 121);
    }
}

//! Behavior checks shared by every backend's test module.

use qkm_core::{
    Identity, KemRecord, KeyId, KeyRecord, KeyState, PairingId, PartyRole, SIMULATED_ALGORITHM,
};

use crate::error::StoreError;
use crate::traits::{Store, TransitionResult};

pub fn alice() -> Identity {
    Identity::parse("alice@example.com").unwrap()
}

pub fn bob() -> Identity {
    Identity::parse("bob@example.com").unwrap()
}

pub fn make_pair_for(
    requester: &Identity,
    recipient: &Identity,
    key_size_bits: usize,
    created_at: i64,
    expires_at: i64,
) -> (KeyRecord, KeyRecord) {
    let pairing_id = PairingId::generate();
    let half = |role: PartyRole, fill: u8| KeyRecord {
        key_id: KeyId::generate(),
        pairing_id: pairing_id.clone(),
        role,
        sealed_material: vec![fill; 8],
        key_size_bits,
        requester: requester.clone(),
        recipient: recipient.clone(),
        state: KeyState::Stored,
        created_at,
        expires_at,
        served_at: None,
        consumed_at: None,
        algorithm: SIMULATED_ALGORITHM.to_string(),
    };
    (half(PartyRole::Initiator, 0xa1), half(PartyRole::Responder, 0xb2))
}

pub fn make_pair(key_size_bits: usize, expires_at: i64) -> (KeyRecord, KeyRecord) {
    make_pair_for(&alice(), &bob(), key_size_bits, 0, expires_at)
}

pub async fn insert_and_get_pair<S: Store>(store: &S) {
    let (initiator, responder) = make_pair(256, 10_000);
    store.insert_pair(&initiator, &responder).await.unwrap();

    let got = store.get_key(&initiator.key_id).await.unwrap().unwrap();
    assert_eq!(got, initiator);

    let peer = store.get_peer(&initiator.key_id).await.unwrap().unwrap();
    assert_eq!(peer, responder);
    let back = store.get_peer(&responder.key_id).await.unwrap().unwrap();
    assert_eq!(back.key_id, initiator.key_id);

    assert!(store.get_key(&KeyId::new("missing")).await.unwrap().is_none());
    assert!(store.get_peer(&KeyId::new("missing")).await.unwrap().is_none());
}

pub async fn duplicate_pair_rejected<S: Store>(store: &S) {
    let (initiator, responder) = make_pair(256, 10_000);
    store.insert_pair(&initiator, &responder).await.unwrap();

    let err = store.insert_pair(&initiator, &responder).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    // A failed pair insert leaves nothing half-written.
    let (fresh, _) = make_pair(256, 10_000);
    let err = store.insert_pair(&fresh, &responder).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert!(store.get_key(&fresh.key_id).await.unwrap().is_none());
}

pub async fn advance_is_forward_only<S: Store>(store: &S) {
    let (initiator, responder) = make_pair(256, 10_000);
    store.insert_pair(&initiator, &responder).await.unwrap();
    let id = &initiator.key_id;

    let served = store
        .advance(id, &[KeyState::Stored, KeyState::Cached], KeyState::Served, 100)
        .await
        .unwrap();
    let served = match served {
        TransitionResult::Applied(record) => record,
        other => panic!("expected Applied, got {other:?}"),
    };
    assert_eq!(served.state, KeyState::Served);
    assert_eq!(served.served_at, Some(100));

    // Second claim from Stored loses.
    let again = store
        .advance(id, &[KeyState::Stored], KeyState::Served, 200)
        .await
        .unwrap();
    assert_eq!(again, TransitionResult::Rejected { current: KeyState::Served });

    // Backward moves never apply, even when the current state is allowed.
    let back = store
        .advance(id, &[KeyState::Served], KeyState::Cached, 200)
        .await
        .unwrap();
    assert_eq!(back, TransitionResult::Rejected { current: KeyState::Served });

    let consumed = store
        .advance(id, &[KeyState::Served], KeyState::Consumed, 300)
        .await
        .unwrap();
    let consumed = match consumed {
        TransitionResult::Applied(record) => record,
        other => panic!("expected Applied, got {other:?}"),
    };
    assert_eq!(consumed.consumed_at, Some(300));
    assert_eq!(consumed.served_at, Some(100));

    let stored = store.get_key(id).await.unwrap().unwrap();
    assert_eq!(stored.state, KeyState::Consumed);
    assert_eq!(stored.sealed_material, initiator.sealed_material);

    let missing = store
        .advance(&KeyId::new("missing"), &[KeyState::Stored], KeyState::Served, 0)
        .await
        .unwrap();
    assert_eq!(missing, TransitionResult::Missing);
}

pub async fn find_spare_filters<S: Store>(store: &S) {
    let carol = Identity::parse("carol@example.com").unwrap();

    let (old, old_peer) = make_pair_for(&alice(), &bob(), 256, 10, 1_000);
    let (new, new_peer) = make_pair_for(&alice(), &bob(), 256, 20, 1_000);
    let (other_size, os_peer) = make_pair_for(&alice(), &bob(), 128, 0, 1_000);
    let (other_party, op_peer) = make_pair_for(&alice(), &carol, 256, 0, 1_000);
    for (a, b) in [
        (&old, &old_peer),
        (&new, &new_peer),
        (&other_size, &os_peer),
        (&other_party, &op_peer),
    ] {
        store.insert_pair(a, b).await.unwrap();
    }

    let spare = store.find_spare(&alice(), &bob(), 256, 500, i64::MAX).await.unwrap().unwrap();
    assert_eq!(spare.key_id, old.key_id);
    assert_eq!(spare.role, PartyRole::Initiator);

    store
        .advance(&old.key_id, &[KeyState::Stored], KeyState::Served, 500)
        .await
        .unwrap();
    let spare = store.find_spare(&alice(), &bob(), 256, 500, i64::MAX).await.unwrap().unwrap();
    assert_eq!(spare.key_id, new.key_id);

    // Direction matters.
    assert!(store.find_spare(&bob(), &alice(), 256, 500, i64::MAX).await.unwrap().is_none());
    // Expired spares are invisible.
    assert!(store.find_spare(&alice(), &bob(), 256, 1_000, i64::MAX).await.unwrap().is_none());
    // So are spares that outlive the requested lifetime.
    assert!(store.find_spare(&alice(), &bob(), 256, 500, 999).await.unwrap().is_none());
    let spare = store.find_spare(&alice(), &bob(), 256, 500, 1_000).await.unwrap().unwrap();
    assert_eq!(spare.key_id, new.key_id);
}

pub async fn expiry_purge_and_counts<S: Store>(store: &S) {
    let (short, short_peer) = make_pair(256, 100);
    let (long, long_peer) = make_pair(256, 10_000);
    store.insert_pair(&short, &short_peer).await.unwrap();
    store.insert_pair(&long, &long_peer).await.unwrap();
    store
        .advance(&long.key_id, &[KeyState::Stored], KeyState::Served, 50)
        .await
        .unwrap();
    store
        .advance(&long_peer.key_id, &[KeyState::Stored], KeyState::Cached, 50)
        .await
        .unwrap();

    let counts = store.count_by_state(50).await.unwrap();
    assert_eq!(counts.stored, 2);
    assert_eq!(counts.cached, 1);
    assert_eq!(counts.served, 1);
    assert_eq!(counts.expired, 0);

    let counts = store.count_by_state(100).await.unwrap();
    assert_eq!(counts.stored, 0);
    assert_eq!(counts.expired, 2);
    assert_eq!(counts.total(), 4);

    assert_eq!(store.delete_expired(100).await.unwrap(), 2);
    assert_eq!(store.delete_expired(100).await.unwrap(), 0);
    assert!(store.get_key(&short.key_id).await.unwrap().is_none());
    assert!(store.get_key(&long.key_id).await.unwrap().is_some());
}

pub async fn list_for_identity<S: Store>(store: &S) {
    let (first, first_peer) = make_pair_for(&alice(), &bob(), 256, 10, 10_000);
    let (second, second_peer) = make_pair_for(&alice(), &bob(), 256, 20, 10_000);
    store.insert_pair(&first, &first_peer).await.unwrap();
    store.insert_pair(&second, &second_peer).await.unwrap();

    let listed = store.list_for_identity(&alice(), 10).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|s| s.key_id.clone()).collect();
    assert_eq!(ids, vec![second.key_id.clone(), first.key_id.clone()]);
    assert!(listed.iter().all(|s| s.role == PartyRole::Initiator));

    let listed = store.list_for_identity(&bob(), 1).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key_id, second_peer.key_id);
}

pub async fn kem_directory<S: Store>(store: &S) {
    assert!(store.get_kem_record(&alice()).await.unwrap().is_none());

    let first = KemRecord {
        identity: alice(),
        algorithm: "ML-KEM-768".to_string(),
        public_key: vec![1; 16],
        sealed_private_key: vec![2; 16],
        created_at: 1,
    };
    assert_eq!(store.insert_kem_record(&first).await.unwrap(), first);

    // A second insert loses and sees the first keypair.
    let second = KemRecord {
        public_key: vec![3; 16],
        created_at: 2,
        ..first.clone()
    };
    assert_eq!(store.insert_kem_record(&second).await.unwrap(), first);
    assert_eq!(store.get_kem_record(&alice()).await.unwrap(), Some(first));

    store.replace_kem_record(&second).await.unwrap();
    assert_eq!(store.get_kem_record(&alice()).await.unwrap(), Some(second));
}

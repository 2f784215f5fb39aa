//! Key generation and signing through the coordinator, both schemes

use super::{outcomes, Harness, PARTIES, THRESHOLD};
use k256::ProjectivePoint;
use std::time::Duration;
use threshold_core::{
    coordinator::Phase,
    curve::{encode_point, scalar_from_biguint},
    sharing::{PrimeField, Share},
    sign::{message_hash, verify_signature},
    Scheme,
};

const MESSAGE: &[u8] = b"transfer 1 ETH to 0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";

// ============================================================================
// Reconstruction scheme
// ============================================================================

#[tokio::test]
async fn test_reconstruction_keygen_agrees_on_group_key() {
    let harness = Harness::new(Scheme::Reconstruction, Duration::from_secs(10));
    let keys = harness.keygen().await;

    assert_eq!(keys.len(), PARTIES);
    let status = harness.session.status();
    for key in &keys {
        assert_eq!(Some(&key.group_key), status.group_key.as_ref());
        assert_eq!(Some(&key.address), status.address.as_ref());
        assert!(key.address.starts_with("0x") && key.address.len() == 42);
        key.verify_public_share().unwrap();
    }

    // any K shares interpolate to the secret behind the group key
    let field = PrimeField::secp256k1();
    let shares: Vec<Share> = keys
        .iter()
        .map(|k| {
            Share::new(
                k.party_index as u64 + 1,
                threshold_core::curve::biguint_from_scalar(&k.secret_share),
            )
        })
        .collect();
    for pair in [[0, 1], [0, 2], [1, 2]] {
        let subset = [shares[pair[0]].clone(), shares[pair[1]].clone()];
        let secret = field.reconstruct_secret(&subset, THRESHOLD).unwrap();
        let point = ProjectivePoint::GENERATOR * scalar_from_biguint(&secret).unwrap();
        assert_eq!(encode_point(&point), keys[0].group_key);
    }
}

#[tokio::test]
async fn test_reconstruction_signing_is_subset_independent() {
    let harness = Harness::new(Scheme::Reconstruction, Duration::from_secs(10));
    let keys = harness.keygen().await;
    let hash = message_hash(MESSAGE);

    let round = harness.answer_sign_request(&keys, &[0, 1, 2]);
    let first = harness.session.sign(MESSAGE, Some(vec![0, 1])).await.unwrap();
    let first_outcomes = outcomes(round).await;

    assert!(first_outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(
        first_outcomes.iter().map(|o| o.contributed).collect::<Vec<_>>(),
        vec![true, true, false]
    );
    assert_eq!(harness.session.phase(), Phase::Complete);

    let round = harness.answer_sign_request(&keys, &[0, 1, 2]);
    let second = harness.session.sign(MESSAGE, Some(vec![1, 2])).await.unwrap();
    outcomes(round).await;

    verify_signature(&keys[0].group_key, &hash, &first).unwrap();
    assert_eq!(first, second);
}

// ============================================================================
// Threshold scheme
// ============================================================================

#[tokio::test]
async fn test_threshold_keygen_and_signing() {
    let harness = Harness::new(Scheme::Threshold, Duration::from_secs(10));
    let keys = harness.keygen().await;
    let hash = message_hash(MESSAGE);

    let group_key = harness.session.group_key().unwrap();
    for key in &keys {
        assert_eq!(key.group_key, group_key);
        assert_eq!(key.public_shares, keys[0].public_shares);
        key.verify_public_share().unwrap();
    }

    let round = harness.answer_sign_request(&keys, &[0, 1, 2]);
    let first = harness.session.sign(MESSAGE, None).await.unwrap();
    let first_outcomes = outcomes(round).await;
    assert!(first_outcomes.iter().all(|o| o.is_ok()));
    assert!(first_outcomes[0].contributed && first_outcomes[1].contributed);

    let round = harness.answer_sign_request(&keys, &[0, 1, 2]);
    let second = harness.session.sign(MESSAGE, Some(vec![0, 2])).await.unwrap();
    outcomes(round).await;

    verify_signature(&group_key, &hash, &first).unwrap();
    verify_signature(&group_key, &hash, &second).unwrap();
    // fresh nonces per round
    assert_ne!(first.r, second.r);
}

#[tokio::test]
async fn test_threshold_signing_with_all_parties() {
    let harness = Harness::new(Scheme::Threshold, Duration::from_secs(10));
    let keys = harness.keygen().await;

    let round = harness.answer_sign_request(&keys, &[0, 1, 2]);
    let signature = harness
        .session
        .sign(b"three signers", Some(vec![2, 0, 1]))
        .await
        .unwrap();
    let round_outcomes = outcomes(round).await;

    assert!(round_outcomes.iter().all(|o| o.contributed && o.is_ok()));
    verify_signature(&keys[1].group_key, &message_hash(b"three signers"), &signature).unwrap();
}

#[tokio::test]
async fn test_sessions_produce_distinct_keys() {
    let a = Harness::new(Scheme::Threshold, Duration::from_secs(10));
    let b = Harness::new(Scheme::Threshold, Duration::from_secs(10));

    let (keys_a, keys_b) = tokio::join!(a.keygen(), b.keygen());
    assert_ne!(keys_a[0].group_key, keys_b[0].group_key);
}

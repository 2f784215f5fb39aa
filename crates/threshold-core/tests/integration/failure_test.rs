//! Protocol violations and stalled parties

use super::{outcomes, Harness, PARTIES, THRESHOLD};
use std::time::Duration;
use threshold_core::{
    coordinator::Phase,
    messages::{kind, RegisterMessage},
    mpc::{send_json, Peer},
    Error, Scheme, DEFAULT_MAX_SIGNING_RETRIES,
};

#[tokio::test]
async fn test_duplicate_registration_does_not_end_session() {
    let harness = Harness::new(Scheme::Reconstruction, Duration::from_secs(10));

    // someone registers as party 0 before party 0 itself does
    send_json(
        harness.transport.as_ref(),
        &harness.session_id(),
        Peer::Party(0),
        Peer::Coordinator,
        kind::REGISTER,
        &RegisterMessage {
            party_index: 0,
            threshold: Some(THRESHOLD),
            total_parties: Some(PARTIES),
        },
    )
    .await
    .unwrap();

    let keys = harness.keygen().await;
    assert_eq!(keys.len(), PARTIES);
    assert_eq!(harness.session.status().participants, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_stalled_signer_times_out_session() {
    let harness = Harness::new(Scheme::Reconstruction, Duration::from_millis(500));
    let keys = harness.keygen().await;

    // party 1 is asked to sign but never answers
    let round = harness.answer_sign_request(&keys, &[0]);
    let result = harness.session.sign(b"never signed", Some(vec![0, 1])).await;

    assert!(matches!(result, Err(Error::PartyTimeout(_))));
    let status = harness.session.wait_for_phase(Phase::Failed).await.unwrap();
    assert!(status.failure.unwrap().contains("[1]"));

    let round_outcomes = outcomes(round).await;
    assert!(round_outcomes[0].contributed);
    assert!(!round_outcomes[0].is_ok());
}

#[tokio::test]
async fn test_unknown_signer_rejected_without_round() {
    let harness = Harness::new(Scheme::Threshold, Duration::from_secs(10));
    harness.keygen().await;

    assert!(matches!(
        harness.session.sign(b"m", Some(vec![0, 7])).await,
        Err(Error::InvalidPartyIndex(7))
    ));
    assert!(matches!(
        harness.session.sign(b"m", Some(vec![1, 1])).await,
        Err(Error::InvalidConfig(_))
    ));
    assert_eq!(harness.session.phase(), Phase::SigningReady);
}

#[tokio::test]
async fn test_missing_party_fails_key_generation() {
    let harness = Harness::new(Scheme::Threshold, Duration::from_millis(300));

    let session_id = harness.session_id();
    let party = harness.parties[0].clone();
    let dkg = tokio::spawn(async move { party.run_dkg(&session_id, None, None).await });

    let status = harness.session.wait_for_phase(Phase::Failed).await.unwrap();
    assert!(status.failure.unwrap().contains("forming"));
    assert!(matches!(dkg.await.unwrap(), Err(Error::Coordinator(_))));
}

#[tokio::test]
async fn test_corrupt_share_exhausts_signing_retries() {
    let harness = Harness::new(Scheme::Reconstruction, Duration::from_secs(10));
    let mut keys = harness.keygen().await;
    keys[1].secret_share += k256::Scalar::ONE;

    for attempt in 0..=DEFAULT_MAX_SIGNING_RETRIES {
        let round = harness.answer_sign_request(&keys, &[0, 1]);
        let result = harness.session.sign(b"transfer", Some(vec![0, 1])).await;
        assert!(matches!(result, Err(Error::VerificationFailed(_))));

        for outcome in outcomes(round).await {
            assert!(outcome.contributed);
            assert!(!outcome.is_ok());
        }
        if attempt < DEFAULT_MAX_SIGNING_RETRIES {
            harness.session.wait_for_phase(Phase::SigningReady).await.unwrap();
        }
    }

    let status = harness.session.wait_for_phase(Phase::Failed).await.unwrap();
    assert!(status.failure.unwrap().contains("consecutive signing rounds"));
    assert!(harness.session.sign(b"transfer", None).await.is_err());
}

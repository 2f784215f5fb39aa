//! End-to-end tests: one coordinator, three parties, one in-memory transport

pub mod failure_test;
pub mod session_flow_test;

use std::sync::Arc;
use std::time::Duration;
use threshold_core::{
    coordinator::{Coordinator, Phase, SessionHandle},
    identity::PersistentSeed,
    mpc::{MemoryTransport, Transport},
    party::{Party, RoundOutcome},
    KeyShare, Scheme, SessionConfig,
};
use tokio::task::JoinHandle;

pub const THRESHOLD: usize = 2;
pub const PARTIES: usize = 3;

/// Log to the test output; `RUST_LOG=threshold_core=debug` for protocol detail
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub transport: Arc<dyn Transport>,
    pub coordinator: Coordinator,
    pub session: SessionHandle,
    pub parties: Vec<Arc<Party>>,
}

impl Harness {
    pub fn new(scheme: Scheme, phase_timeout: Duration) -> Self {
        init_tracing();
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let coordinator = Coordinator::new(Arc::clone(&transport));
        let config = SessionConfig::new(PARTIES, THRESHOLD, scheme)
            .unwrap()
            .with_session_id(format!("test-{}", uuid::Uuid::new_v4()))
            .with_phase_timeout(phase_timeout);
        let session = coordinator.open_session(config).unwrap();

        let parties = (0..PARTIES)
            .map(|index| {
                Arc::new(
                    Party::new(Arc::clone(&transport), index, PersistentSeed::generate())
                        .with_timeout(Duration::from_secs(10)),
                )
            })
            .collect();

        Self {
            transport,
            coordinator,
            session,
            parties,
        }
    }

    pub fn session_id(&self) -> String {
        self.session.session_id().to_string()
    }

    /// Run key generation on every party and wait for `SigningReady`
    pub async fn keygen(&self) -> Vec<KeyShare> {
        let handles: Vec<JoinHandle<_>> = self
            .parties
            .iter()
            .map(|party| {
                let party = Arc::clone(party);
                let session_id = self.session_id();
                tokio::spawn(async move {
                    party
                        .run_dkg(&session_id, Some(THRESHOLD), Some(PARTIES))
                        .await
                })
            })
            .collect();

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap().unwrap());
        }
        self.session.wait_for_phase(Phase::SigningReady).await.unwrap();
        keys
    }

    /// Start `sign_round` on the given parties
    pub fn answer_sign_request(
        &self,
        keys: &[KeyShare],
        parties: &[usize],
    ) -> Vec<JoinHandle<RoundOutcome>> {
        parties
            .iter()
            .map(|&index| {
                let party = Arc::clone(&self.parties[index]);
                let key = keys[index].clone();
                tokio::spawn(async move { party.sign_round(&key).await.unwrap() })
            })
            .collect()
    }
}

pub async fn outcomes(handles: Vec<JoinHandle<RoundOutcome>>) -> Vec<RoundOutcome> {
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    outcomes
}

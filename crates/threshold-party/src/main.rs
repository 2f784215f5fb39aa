//! Threshold Party CLI
//!
//! Command-line interface for the processes of a signing session:
//! - Party identity management
//! - Session coordinator
//! - Key generation
//! - Answering signing requests

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use msg_relay_client::RelayClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use threshold_core::{
    coordinator::{Coordinator, Phase},
    identity::PersistentSeed,
    mpc::Transport,
    party::Party,
    curve, KeyShare, PartyIndex, Scheme, SessionConfig, Signature, DEFAULT_MAX_SIGNING_RETRIES,
    DEFAULT_PARTIES, DEFAULT_THRESHOLD,
};
use tracing::{error, info, warn, Level};

/// Threshold Party - key generation and signing node
#[derive(Parser)]
#[command(name = "threshold-party")]
#[command(about = "Threshold key generation and signing node")]
#[command(version)]
struct Cli {
    /// Relay service URL
    #[arg(short, long, env = "RELAY_URL", default_value = "http://127.0.0.1:8080")]
    relay: String,

    /// Party index (0-indexed); not needed by the coordinator
    #[arg(short, long, env = "PARTY_INDEX")]
    party_index: Option<PartyIndex>,

    /// Data directory for identities and key shares
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    /// Seconds any single wait may take
    #[arg(long, env = "PHASE_TIMEOUT", default_value = "120")]
    phase_timeout: u64,

    /// Seconds the relay holds each read request open
    #[arg(long, env = "RELAY_POLL", default_value = "20")]
    relay_poll: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the party identity if it does not exist yet
    Identity,

    /// Run a session coordinator
    Coordinator {
        /// Session identifier (`session-<unix millis>` if omitted)
        #[arg(short, long, env = "SESSION_ID")]
        session_id: Option<String>,

        /// Threshold K
        #[arg(short, long, env = "THRESHOLD", default_value_t = DEFAULT_THRESHOLD)]
        threshold: usize,

        /// Number of parties N
        #[arg(short = 'n', long, env = "TOTAL_PARTIES", default_value_t = DEFAULT_PARTIES)]
        total_parties: usize,

        /// reconstruction | threshold
        #[arg(long, env = "SCHEME", default_value = "reconstruction")]
        scheme: Scheme,

        /// Messages to sign once the key is ready
        #[arg(short, long)]
        message: Vec<String>,

        /// Signing party indices (comma-separated); lowest K ready parties if omitted
        #[arg(long)]
        signers: Option<String>,

        /// Consecutive rejected signing rounds tolerated before the session fails
        #[arg(long, env = "MAX_SIGNING_RETRIES", default_value_t = DEFAULT_MAX_SIGNING_RETRIES)]
        max_signing_retries: usize,
    },

    /// Run key generation for a session
    Keygen {
        /// Session identifier
        #[arg(short, long, env = "SESSION_ID")]
        session_id: String,

        /// Expected threshold, checked against the coordinator
        #[arg(short, long, env = "THRESHOLD")]
        threshold: Option<usize>,

        /// Expected number of parties, checked against the coordinator
        #[arg(short = 'n', long, env = "TOTAL_PARTIES")]
        total_parties: Option<usize>,
    },

    /// Answer signing requests with a saved key share
    Serve {
        /// Stop after this many rounds
        #[arg(long)]
        rounds: Option<usize>,
    },

    /// Show key share info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    // Ensure data directory exists
    std::fs::create_dir_all(&cli.dest)?;

    let client = RelayClient::new(&cli.relay).with_poll(Duration::from_secs(cli.relay_poll));
    if matches!(
        cli.command,
        Commands::Coordinator { .. } | Commands::Keygen { .. } | Commands::Serve { .. }
    ) {
        client
            .health()
            .await
            .with_context(|| format!("relay at {} is not reachable", client.url()))?;
    }
    let relay: Arc<dyn Transport> = Arc::new(client);

    match cli.command {
        Commands::Identity => {
            let index = party_index(&cli)?;
            let path = identity_path(&cli, index);
            PersistentSeed::load_or_generate(&path)?;
            println!("Identity: {}", path.display());
        }
        Commands::Coordinator {
            ref session_id,
            threshold,
            total_parties,
            scheme,
            ref message,
            ref signers,
            max_signing_retries,
        } => {
            let signers = signers.as_deref().map(parse_signers).transpose()?;
            let mut config = SessionConfig::new(total_parties, threshold, scheme)?
                .with_phase_timeout(Duration::from_secs(cli.phase_timeout))
                .with_max_signing_retries(max_signing_retries);
            if let Some(session_id) = session_id {
                config = config.with_session_id(session_id.clone());
            }
            run_coordinator(relay, config, message, signers).await?;
        }
        Commands::Keygen {
            ref session_id,
            threshold,
            total_parties,
        } => {
            run_keygen(&cli, relay, session_id, threshold, total_parties).await?;
        }
        Commands::Serve { rounds } => {
            run_serve(&cli, relay, rounds).await?;
        }
        Commands::Info => {
            show_info(&cli)?;
        }
    }

    Ok(())
}

async fn run_coordinator(
    relay: Arc<dyn Transport>,
    config: SessionConfig,
    messages: &[String],
    signers: Option<Vec<PartyIndex>>,
) -> Result<()> {
    info!(
        session_id = %config.session_id,
        n_parties = config.total_parties,
        threshold = config.threshold,
        scheme = %config.scheme,
        "Starting coordinator"
    );
    println!("Session ID: {}", config.session_id);

    let coordinator = Coordinator::new(relay);
    let session = coordinator.open_session(config)?;

    let status = session.wait_for_phase(Phase::SigningReady).await?;
    let group_key = status.group_key.unwrap_or_default();
    println!("Group Key: {}", hex::encode(&group_key));
    println!("Address: {}", status.address.unwrap_or_default());

    for message in messages {
        info!(message = %message, "Requesting signature");
        match session.sign(message.as_bytes(), signers.clone()).await {
            Ok(signature) => print_signature(message, &signature),
            Err(e) => {
                error!(message = %message, error = %e, "Signing failed");
                if session.phase() == Phase::Failed {
                    break;
                }
            }
        }
    }

    session.close().await;
    Ok(())
}

async fn run_keygen(
    cli: &Cli,
    relay: Arc<dyn Transport>,
    session_id: &str,
    threshold: Option<usize>,
    total_parties: Option<usize>,
) -> Result<()> {
    let index = party_index(cli)?;

    info!(
        party_index = index,
        session_id = session_id,
        "Starting key generation"
    );

    let seed = PersistentSeed::load_or_generate(&identity_path(cli, index))?;
    let party = Party::new(relay, index, seed)
        .with_timeout(Duration::from_secs(cli.phase_timeout));
    let key_share = party.run_dkg(session_id, threshold, total_parties).await?;

    // Save key share
    let key_share_path = key_share_path(cli, index);
    let json = serde_json::to_string_pretty(&key_share)?;
    std::fs::write(&key_share_path, json)?;

    info!(
        group_key = hex::encode(&key_share.group_key),
        path = ?key_share_path,
        "Key generation completed, key share saved"
    );

    println!("Group Key: {}", hex::encode(&key_share.group_key));
    println!("Address: {}", key_share.address);

    Ok(())
}

async fn run_serve(cli: &Cli, relay: Arc<dyn Transport>, rounds: Option<usize>) -> Result<()> {
    let index = party_index(cli)?;
    let key_share = load_key_share(cli, index)?;
    let seed = PersistentSeed::load_or_generate(&identity_path(cli, index))?;
    let party = Party::new(relay, index, seed)
        .with_timeout(Duration::from_secs(cli.phase_timeout));

    info!(
        party_index = index,
        session_id = %key_share.session_id,
        "Serving signing requests"
    );

    let mut served = 0;
    while rounds.map_or(true, |limit| served < limit) {
        match party.sign_round(&key_share).await {
            Ok(outcome) => {
                served += 1;
                match (&outcome.signature, &outcome.error) {
                    (Some(signature), _) => print_signature(&outcome.request_id, signature),
                    (None, Some(e)) => {
                        warn!(request_id = %outcome.request_id, error = %e, "Round failed")
                    }
                    (None, None) => {}
                }
            }
            Err(threshold_core::Error::PartyTimeout(what)) => {
                info!(waiting_for = %what, "No signing request yet");
            }
            Err(e) if !e.is_fatal() => warn!(error = %e, "Round abandoned"),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn show_info(cli: &Cli) -> Result<()> {
    let index = party_index(cli)?;
    let key_share = load_key_share(cli, index)?;

    println!("Key Share Info:");
    println!("  Session ID: {}", key_share.session_id);
    println!("  Party Index: {}", key_share.party_index);
    println!("  N Parties: {}", key_share.total_parties);
    println!("  Threshold: {}", key_share.threshold);
    println!("  Scheme: {}", key_share.scheme);
    println!("  Group Key: {}", hex::encode(&key_share.group_key));
    println!("  Address: {}", key_share.address);

    Ok(())
}

fn print_signature(label: &str, signature: &Signature) {
    println!("Signature ({}):", label);
    println!("  r: {}", hex::encode(signature.r));
    println!("  s: {}", hex::encode(signature.s));
    println!("  v: {}", signature.recovery_id);
}

fn parse_signers(list: &str) -> Result<Vec<PartyIndex>> {
    list.split(',')
        .map(|s| {
            s.trim()
                .parse::<PartyIndex>()
                .with_context(|| format!("bad party index: {:?}", s))
        })
        .collect()
}

fn party_index(cli: &Cli) -> Result<PartyIndex> {
    cli.party_index
        .ok_or_else(|| anyhow!("--party-index is required for this command"))
}

fn identity_path(cli: &Cli, index: PartyIndex) -> PathBuf {
    cli.dest.join(format!("identity.{}.json", index))
}

fn key_share_path(cli: &Cli, index: PartyIndex) -> PathBuf {
    cli.dest.join(format!("keyshare.{}.json", index))
}

fn load_key_share(cli: &Cli, index: PartyIndex) -> Result<KeyShare> {
    let path = key_share_path(cli, index);
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("no key share at {}", path.display()))?;
    let key_share: KeyShare = serde_json::from_str(&json)?;
    check_key_share(&key_share)
        .with_context(|| format!("corrupt key share at {}", path.display()))?;
    Ok(key_share)
}

/// The stored address must belong to the stored group key
fn check_key_share(key_share: &KeyShare) -> Result<()> {
    let group_point = key_share.group_key_point()?;
    if curve::address(&group_point) != key_share.address {
        return Err(anyhow!("address does not match the group key"));
    }
    if key_share.scheme == Scheme::Threshold {
        key_share.verify_public_share()?;
    }
    Ok(())
}

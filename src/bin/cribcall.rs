//! `cribcall` — CLI entry point wiring file-backed implementations of
//! the library's injected interfaces to the control plane's TLS
//! listeners.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use cribcall_core::clock::{SystemClock, SystemRandom};
use cribcall_core::config::Settings;
use cribcall_core::error::CribCallError;
use cribcall_core::fanout::{FanoutEngine, PushGateway};
use cribcall_core::identity::{load_or_create, Identity, SecureIdentityStore};
use cribcall_core::noise_event::NoiseEvent;
use cribcall_core::pairing::PairingManager;
use cribcall_core::repository::{FileStore, KeyValueStore};
use cribcall_core::subscription::SubscriptionRegistry;
use cribcall_core::trust_store::{PeerRepository, PeerRole, TrustStore, TrustedPeer};
use cribcall_core::transport::client;
use cribcall_core::transport::{self, ControlPlane, LiveSessionRegistry};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// CribCall device control plane CLI.
#[derive(Parser)]
#[command(name = "cribcall")]
#[command(about = "LAN peer-to-peer baby-monitor control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Directory holding the identity, trust store, and subscription files.
    #[arg(long, default_value = "./cribcall-data")]
    data_dir: PathBuf,

    /// Path to a TOML configuration file; defaults are used if absent.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print this device's identity fingerprint, generating one if needed.
    Identity,
    /// Run the Monitor role: serve the pairing and control endpoints.
    Serve,
    /// Mint a single-use pairing token and print it as an SVG QR code.
    IssuePairingToken,
    /// Run the Listener role: pair with a Monitor at `monitor_addr`,
    /// pinning its certificate to `fingerprint` obtained out-of-band
    /// (QR scan or manual entry), then persist the resulting trust record.
    Pair {
        monitor_addr: SocketAddr,
        fingerprint: String,
        #[arg(long)]
        qr_token: Option<String>,
    },
    /// Run the Listener role: maintain a reconnecting control connection
    /// to an already-paired Monitor, printing inbound noise events.
    Listen {
        monitor_addr: SocketAddr,
        monitor_fingerprint: String,
        monitor_device_id: String,
    },
}

struct FileIdentityStore {
    store: FileStore,
}

#[async_trait]
impl SecureIdentityStore for FileIdentityStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, CribCallError> {
        self.store.get("identity").await
    }
    async fn save(&self, serialized: &[u8]) -> Result<(), CribCallError> {
        self.store.put("identity", serialized).await
    }
}

struct FilePeerRepository {
    store: FileStore,
}

#[async_trait]
impl PeerRepository for FilePeerRepository {
    async fn load_all(&self) -> Result<Vec<TrustedPeer>, CribCallError> {
        let keys = self.store.list("peer_").await?;
        let mut peers = Vec::new();
        for key in keys {
            if let Some(bytes) = self.store.get(&key).await? {
                if let Ok(peer) = serde_json::from_slice::<TrustedPeer>(&bytes) {
                    peers.push(peer);
                }
            }
        }
        Ok(peers)
    }

    async fn put(&self, peer: &TrustedPeer) -> Result<(), CribCallError> {
        let key = format!("peer_{}", peer.certificate_fingerprint);
        let bytes = serde_json::to_vec(peer)
            .map_err(|e| CribCallError::RepositoryUnavailable(e.to_string()))?;
        self.store.put(&key, &bytes).await
    }

    async fn delete(&self, fingerprint: &str) -> Result<(), CribCallError> {
        self.store.delete(&format!("peer_{fingerprint}")).await
    }
}

struct FileSubscriptionRepository {
    store: FileStore,
}

#[async_trait]
impl cribcall_core::subscription::SubscriptionRepository for FileSubscriptionRepository {
    async fn load_all(&self) -> Result<Vec<cribcall_core::subscription::NoiseSubscription>, CribCallError> {
        let keys = self.store.list("sub_").await?;
        let mut subs = Vec::new();
        for key in keys {
            if let Some(bytes) = self.store.get(&key).await? {
                if let Ok(sub) = serde_json::from_slice(&bytes) {
                    subs.push(sub);
                }
            }
        }
        Ok(subs)
    }

    async fn put(&self, sub: &cribcall_core::subscription::NoiseSubscription) -> Result<(), CribCallError> {
        let key = format!("sub_{}", sub.subscription_id);
        let bytes = serde_json::to_vec(sub)
            .map_err(|e| CribCallError::RepositoryUnavailable(e.to_string()))?;
        self.store.put(&key, &bytes).await
    }

    async fn delete(&self, subscription_id: &str) -> Result<(), CribCallError> {
        self.store.delete(&format!("sub_{subscription_id}")).await
    }
}

/// No gateway wired up yet — gateway-push subscriptions are accepted but
/// never delivered until a concrete FCM/APNs adapter is plugged in here.
struct UnconfiguredPushGateway;

#[async_trait]
impl PushGateway for UnconfiguredPushGateway {
    async fn push(&self, _platform: &str, _token: &str, _event: &NoiseEvent) -> Result<(), CribCallError> {
        Err(CribCallError::DeliveryFailedTransient(
            "no push gateway configured".into(),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load(path).await?,
        None => Settings::default(),
    };

    let identity_store = FileIdentityStore {
        store: FileStore::new(cli.data_dir.join("identity")),
    };
    let identity = Arc::new(load_or_create(&identity_store).await?);

    match cli.command {
        Commands::Identity => {
            println!("device_id: {}", identity.device_id);
            println!("fingerprint: {}", identity.fingerprint_hex);
        }
        Commands::IssuePairingToken => {
            let trust_store = Arc::new(
                TrustStore::load(Arc::new(FilePeerRepository {
                    store: FileStore::new(cli.data_dir.join("trust")),
                }))
                .await?,
            );
            let pairing = PairingManager::new(
                identity.clone(),
                settings.display_name.clone(),
                trust_store,
                Arc::new(SystemClock),
            );
            println!("{}", pairing.issue_qr_code_svg(&settings.pairing_listen_addr.to_string())?);
        }
        Commands::Serve => {
            run_serve(identity, settings, cli.data_dir).await?;
        }
        Commands::Pair { monitor_addr, fingerprint, qr_token } => {
            run_pair(identity, settings, cli.data_dir, monitor_addr, fingerprint, qr_token).await?;
        }
        Commands::Listen { monitor_addr, monitor_fingerprint, monitor_device_id } => {
            run_listen(identity, cli.data_dir, monitor_addr, monitor_fingerprint, monitor_device_id).await?;
        }
    }

    Ok(())
}

/// Drives the Listener half of the pairing handshake (spec.md §4.3):
/// dial with a pinned fingerprint, show the human the comparison code,
/// and on confirmation persist the Monitor as a trusted peer.
async fn run_pair(
    identity: Arc<Identity>,
    settings: Settings,
    data_dir: PathBuf,
    monitor_addr: SocketAddr,
    fingerprint: String,
    qr_token: Option<String>,
) -> anyhow::Result<()> {
    let challenge = client::dial_pair_init(
        monitor_addr,
        &fingerprint,
        &identity,
        settings.display_name.clone(),
        qr_token,
    )
    .await?;

    println!("Monitor: {}", challenge.monitor_name);
    println!("Comparison code: {}", challenge.comparison_code());
    print!("Does this match the code shown on the Monitor? [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    if !answer.trim().eq_ignore_ascii_case("y") {
        anyhow::bail!("pairing aborted by operator");
    }

    let confirm = client::dial_pair_confirm(monitor_addr, challenge).await?;

    let trust_store = Arc::new(
        TrustStore::load(Arc::new(FilePeerRepository {
            store: FileStore::new(data_dir.join("trust")),
        }))
        .await?,
    );
    trust_store
        .add(TrustedPeer {
            remote_device_id: confirm.remote_device_id,
            display_name: confirm.monitor_name.clone(),
            certificate_fingerprint: fingerprint,
            certificate_der: Some(confirm.certificate_der),
            last_known_address: Some(monitor_addr.to_string()),
            out_of_band_delivery_token: None,
            added_at: chrono::Utc::now(),
            role: PeerRole::Monitor,
            control_port: Some(monitor_addr.port()),
            pairing_port: None,
            transport_tag: None,
        })
        .await?;

    println!("paired and trusted {monitor_addr}");
    Ok(())
}

/// Runs the Listener's persistent control connection to an already-paired
/// Monitor, reconnecting with backoff until the process is interrupted.
async fn run_listen(
    identity: Arc<Identity>,
    data_dir: PathBuf,
    monitor_addr: SocketAddr,
    monitor_fingerprint: String,
    monitor_device_id: String,
) -> anyhow::Result<()> {
    let trust_store = Arc::new(
        TrustStore::load(Arc::new(FilePeerRepository {
            store: FileStore::new(data_dir.join("trust")),
        }))
        .await?,
    );

    client::run_control_client_with_reconnect(
        monitor_addr,
        identity,
        trust_store,
        monitor_fingerprint,
        monitor_device_id,
        None,
        Arc::new(SystemRandom),
        |message| {
            tracing::info!(?message, "received control message");
        },
        || true,
    )
    .await;

    Ok(())
}

async fn run_serve(identity: Arc<Identity>, settings: Settings, data_dir: PathBuf) -> anyhow::Result<()> {
    let trust_store = Arc::new(
        TrustStore::load(Arc::new(FilePeerRepository {
            store: FileStore::new(data_dir.join("trust")),
        }))
        .await?,
    );
    let subscriptions = Arc::new(
        SubscriptionRegistry::load(Arc::new(FileSubscriptionRepository {
            store: FileStore::new(data_dir.join("subscriptions")),
        }))
        .await?,
    );
    let pairing = Arc::new(PairingManager::new(
        identity.clone(),
        settings.display_name.clone(),
        trust_store.clone(),
        Arc::new(SystemClock),
    ));
    let live_sessions = Arc::new(LiveSessionRegistry::new());
    let fanout = Arc::new(FanoutEngine::new(
        subscriptions.clone(),
        Arc::new(UnconfiguredPushGateway),
        live_sessions.clone(),
    ));

    let plane = Arc::new(ControlPlane::new(
        identity,
        trust_store,
        pairing,
        subscriptions,
        fanout,
        live_sessions,
        None,
    ));

    tracing::info!(
        pairing_addr = %settings.pairing_listen_addr,
        control_addr = %settings.control_listen_addr,
        "starting cribcall control plane"
    );

    let pairing_addr = settings.pairing_listen_addr;
    let control_addr = settings.control_listen_addr;
    let pairing_plane = plane.clone();
    let control_plane = plane.clone();

    let pairing_task = tokio::spawn(async move { transport::serve_pairing(pairing_addr, pairing_plane).await });
    let control_task = tokio::spawn(async move { transport::serve_control(control_addr, control_plane).await });
    let sweep_subscriptions = plane.subscriptions.clone();
    let sweep_task = tokio::spawn(async move { run_subscription_sweep(sweep_subscriptions).await });

    let (pairing_result, control_result, _) = tokio::try_join!(pairing_task, control_task, sweep_task)?;
    pairing_result?;
    control_result?;
    Ok(())
}

/// Periodic sweep (spec.md §4.7) that physically removes subscriptions
/// past their lease; fan-out already skips them lazily, so this loop only
/// needs to run on [`SubscriptionRegistry::sweep_interval`]'s cadence, not
/// anything tighter.
async fn run_subscription_sweep(subscriptions: Arc<SubscriptionRegistry>) {
    let mut interval = tokio::time::interval(SubscriptionRegistry::sweep_interval());
    interval.tick().await; // first tick fires immediately; consume it.
    loop {
        interval.tick().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        match subscriptions.sweep_expired(now_ms).await {
            Ok(removed) if removed > 0 => {
                tracing::info!(removed, "swept expired noise subscriptions");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "subscription sweep failed"),
        }
    }
}

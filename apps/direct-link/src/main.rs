mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use direct_connection::{
    pump_inbox, AcceptOptions, BusRelay, CloseOptions, Connection, ConnectionEvent,
    ConnectionParams, ConnectionRegistry, ConnectionSettings, IceServer, Role, StatsOptions,
    WebRtcTransportFactory,
};
use signal_bus::{LocalSignalBus, SignalBus};
use tokio::sync::mpsc;
use tracing::info;

use telemetry::{LogConfig, LogLevel};

const SESSION: &str = "loopback";

#[derive(Parser, Debug)]
#[command(name = "direct-link", about = "Negotiate a loopback peer link and exchange one message")]
struct Cli {
    #[arg(long, env = "DIRECT_CONFIG", help = "TOML file with connection settings")]
    config: Option<PathBuf>,

    #[arg(long = "ice-server", help = "STUN/TURN URL; repeat for several")]
    ice_servers: Vec<String>,

    #[arg(long, help = "Only signal relay candidates")]
    force_relay: bool,

    #[arg(long, default_value = "hello from the initiator")]
    message: String,

    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    #[arg(long, help = "Sample transport statistics every N milliseconds")]
    stats_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn, env = "DIRECT_LOG_LEVEL")]
    log_level: LogLevel,

    #[arg(long, env = "DIRECT_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn settings(&self) -> Result<ConnectionSettings> {
        let mut settings = match &self.config {
            Some(path) => {
                let body = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                ConnectionSettings::from_toml_str(&body)?
            }
            None => ConnectionSettings::from_env()?,
        };
        if !self.ice_servers.is_empty() {
            settings.ice_servers = self.ice_servers.iter().map(IceServer::new).collect();
        }
        if self.force_relay {
            settings.force_relay = true;
        }
        Ok(settings)
    }
}

struct Peer {
    conn: Connection,
    registry: Arc<ConnectionRegistry>,
}

fn spawn_peer(
    bus: &Arc<LocalSignalBus>,
    role: Role,
    me: &str,
    other: &str,
    settings: &ConnectionSettings,
) -> Peer {
    let relay = BusRelay::new(bus.clone(), me, other, SESSION).with_reports_to("reports");
    let params = ConnectionParams::new(
        role,
        SESSION,
        Arc::new(relay),
        Arc::new(WebRtcTransportFactory::new()),
    )
    .with_settings(settings.clone());
    let conn = Connection::new(params);
    let registry = Arc::new(ConnectionRegistry::new());
    registry.insert(conn.clone());
    tokio::spawn(pump_inbox(bus.register(me), registry.clone()));
    Peer { conn, registry }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;
    let settings = cli.settings()?;

    let bus = Arc::new(LocalSignalBus::new());
    let mut reports = bus.register("reports");
    let initiator = spawn_peer(&bus, Role::Initiator, "initiator", "responder", &settings);
    let responder = spawn_peer(&bus, Role::Responder, "responder", "initiator", &settings);

    let (received_tx, mut received_rx) = mpsc::unbounded_channel();
    responder
        .conn
        .accept(AcceptOptions {
            on_message: Some(Arc::new(move |event: &ConnectionEvent| {
                if let ConnectionEvent::Message(value) = event {
                    let _ = received_tx.send(value.clone());
                }
            })),
            ..Default::default()
        })
        .await?;
    responder.conn.approve();

    let mut initiator_events = initiator.conn.subscribe();
    initiator.conn.accept(AcceptOptions::default()).await?;
    if let Some(ms) = cli.stats_ms {
        initiator.conn.get_stats(StatsOptions {
            interval: Some(Duration::from_millis(ms)),
        })?;
    }
    initiator.conn.approve();

    let deadline = Duration::from_secs(cli.timeout_secs);
    let exchanged = tokio::time::timeout(deadline, async {
        loop {
            match initiator_events.recv().await {
                Ok(ConnectionEvent::Open) => break,
                Ok(ConnectionEvent::Close { .. }) => bail!("initiator closed before the channel opened"),
                Ok(_) => {}
                Err(err) => bail!("event stream ended: {err}"),
            }
        }
        info!(target = "direct_link", "channel open; sending message");
        initiator.conn.send_message(cli.message.as_str())?;
        received_rx
            .recv()
            .await
            .context("responder stopped listening")
    })
    .await
    .context("timed out waiting for the message")??;

    println!("responder received: {exchanged}");
    println!(
        "initiator {} / responder {}",
        initiator.conn.state(),
        responder.conn.state()
    );

    initiator.conn.close(CloseOptions::default());
    tokio::time::timeout(Duration::from_secs(5), async {
        while !responder.conn.state().is_terminal() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("responder never saw the hang-up")?;

    for _ in 0..2 {
        let envelope = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .context("usage report missing")??;
        let report: serde_json::Value = serde_json::from_slice(&envelope.payload)?;
        println!(
            "usage report from {}:\n{}",
            envelope.from,
            serde_json::to_string_pretty(&report["report"])?
        );
    }
    info!(
        target = "direct_link",
        live_initiator = initiator.registry.len(),
        live_responder = responder.registry.len(),
        "done"
    );
    Ok(())
}

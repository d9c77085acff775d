use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use parley::session::SessionError;
use parley::transport::TokioWebSocketTransportFactory;
use parley::voice::VoiceRegistry;
use parley::{
    CloseReason, ConnectionKind, Credential, Recovery, SessionClient, SessionConfig, SessionEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

// Demo driver: keeps one session alive and logs everything it receives.
//
// Usage:
//   cargo run -- --url wss://chat.example/gateway --token TOKEN
//   cargo run -- --url wss://chat.example/central --token TOKEN --central
//   RUST_LOG=debug cargo run -- ...          # frame-level logging

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Session protocol demo client")]
struct Args {
    /// Gateway websocket URL.
    #[arg(long)]
    url: String,

    /// Credential sent with `identify` and `resume`.
    #[arg(long, env = "PARLEY_TOKEN")]
    token: String,

    /// Talk to the account-wide central service (unsequenced).
    #[arg(long)]
    central: bool,

    #[arg(long, default_value_t = 15)]
    connect_timeout_secs: u64,

    /// Resume attempts before falling back to a fresh connect.
    #[arg(long, default_value_t = 3)]
    resume_attempts: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let kind = if args.central {
        ConnectionKind::Central
    } else {
        ConnectionKind::Server
    };
    let config = SessionConfig {
        connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        ..Default::default()
    };
    let client = SessionClient::new(kind, config, Arc::new(TokioWebSocketTransportFactory::new()));
    let credential = Credential::new(args.token.clone());
    let mut events = client.subscribe();
    let mut voice = VoiceRegistry::new();

    connect_with_retry(&client, &args, &credential).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down.");
                client.disconnect().await;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Ready(ready)) => {
                    info!(
                        "Ready: session {} ({} snapshot fields)",
                        ready.session_id,
                        ready.snapshot.len()
                    );
                    voice.load_snapshot(&ready);
                }
                Ok(SessionEvent::Resumed { session_id, last_seq }) => {
                    info!("Resumed session {session_id} after seq {last_seq}");
                }
                Ok(SessionEvent::Dispatch(dispatch)) => {
                    info!("<-- {} (seq {:?}) {}", dispatch.event, dispatch.seq, dispatch.data);
                    if voice.apply_dispatch(&dispatch) {
                        info!("{} users in voice", voice.len());
                    }
                }
                Ok(SessionEvent::Disconnected(disconnect)) => {
                    warn!(
                        "Disconnected: {} ({:?}) {}",
                        disconnect.reason, disconnect.code, disconnect.message
                    );
                    recover(&client, &args, &credential, disconnect.reason).await?;
                }
                Err(RecvError::Lagged(missed)) => warn!("Event log lagged, {missed} events skipped"),
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// Follows the close reason's recovery hint: resume when the session is
/// still good, otherwise a fresh connect.
async fn recover(
    client: &Arc<SessionClient>,
    args: &Args,
    credential: &Credential,
    reason: CloseReason,
) -> anyhow::Result<()> {
    match reason.recovery() {
        Recovery::Reauthenticate => {
            anyhow::bail!("credential rejected ({reason}); log in again");
        }
        Recovery::Resume if client.kind().is_sequenced() && client.session_id().is_some() => {
            for attempt in 1..=args.resume_attempts {
                tokio::time::sleep(backoff(attempt)).await;
                match client.resume(&args.url, credential, client.last_seq()).await {
                    Ok(()) => return Ok(()),
                    Err(SessionError::ResumeFailed(reason)) => {
                        warn!("Resume refused ({reason}), starting a fresh session");
                        break;
                    }
                    Err(e) => warn!("Resume attempt {attempt} failed: {e}"),
                }
            }
        }
        Recovery::ReconnectAfterBackoff(wait) => {
            info!("Server asked us to back off for {wait:?}");
            tokio::time::sleep(wait).await;
        }
        Recovery::Resume | Recovery::Reconnect => {}
    }
    connect_with_retry(client, args, credential).await
}

async fn connect_with_retry(
    client: &Arc<SessionClient>,
    args: &Args,
    credential: &Credential,
) -> anyhow::Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.connect(&args.url, credential).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                if let Some(reason) = e.close_reason()
                    && reason.recovery() == Recovery::Reauthenticate
                {
                    error!("Connect rejected: {e}");
                    return Err(e.into());
                }
                let wait = backoff(attempt);
                warn!("Connect attempt {attempt} failed: {e}; retrying in {wait:?}");
                tokio::time::sleep(wait).await;
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt.min(5)))
}

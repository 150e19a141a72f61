//! GameDock hub CLI: discover agents on the LAN, pair with them, and push
//! game installs that show up as launchable shortcuts.

mod client;
mod discovery;
mod uploader;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dock_core::protocol::{Envelope, MessageKind, PairRequired, TransferConfig, UploadProgress};
use dock_core::trust::{load_or_create_identity, TrustStore};

use client::{AgentClient, ShortcutManager};
use discovery::{AgentRegistry, DiscoveredAgent, DiscoveryClient};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "\
dock-hub - deploy games to GameDock agents

USAGE:
    dock-hub discover [--timeout <secs>]
    dock-hub watch
    dock-hub shortcuts <agent>
    dock-hub deploy <agent> <dir> <name> --exe <rel-path>
                    [--launch-options <opts>] [--tags <a,b,c>]

<agent> is an agent id or advertised name from `discover`.";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("discover") => {
            let timeout = flag_value(&args, "--timeout")
                .map(|s| s.parse::<u64>().context("bad --timeout"))
                .transpose()?
                .unwrap_or(3);
            cmd_discover(Duration::from_secs(timeout)).await
        }
        Some("watch") => cmd_watch().await,
        Some("shortcuts") => match args.get(1) {
            Some(agent) => cmd_shortcuts(agent).await,
            None => usage_error("shortcuts needs an agent"),
        },
        Some("deploy") => cmd_deploy(&args[1..]).await,
        Some("--version") | Some("-V") => {
            println!("dock-hub {VERSION}");
            Ok(())
        }
        _ => usage_error("missing or unknown command"),
    }
}

fn usage_error(msg: &str) -> Result<()> {
    eprintln!("error: {msg}\n\n{USAGE}");
    std::process::exit(2);
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

async fn cmd_discover(timeout: Duration) -> Result<()> {
    let registry = Arc::new(AgentRegistry::new());
    let (discovery, _events) = DiscoveryClient::new(Arc::clone(&registry))?;
    let agents = discovery.discover(timeout).await?;
    if agents.is_empty() {
        println!("no agents found");
        return Ok(());
    }
    println!("{:<38} {:<20} {:<8} {:<8} ADDRESS", "ID", "NAME", "PLATFORM", "VERSION");
    for a in agents {
        println!(
            "{:<38} {:<20} {:<8} {:<8} {}",
            a.id,
            a.name,
            a.platform,
            a.version,
            a.dial_addr().unwrap_or_default()
        );
    }
    Ok(())
}

/// Continuous discovery until ctrl-c: prints agents as they appear, change,
/// and drop off the network.
async fn cmd_watch() -> Result<()> {
    let registry = Arc::new(AgentRegistry::new());
    let (discovery, mut events) = DiscoveryClient::new(Arc::clone(&registry))?;
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_signal.cancel();
        }
    });
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                discovery::DiscoveryEvent::Discovered(a) => {
                    println!("+ {} ({}) {}", a.name, a.id, a.dial_addr().unwrap_or_default());
                }
                discovery::DiscoveryEvent::Updated(a) => {
                    println!("~ {} ({}) {}", a.name, a.id, a.dial_addr().unwrap_or_default());
                }
                discovery::DiscoveryEvent::Lost(id) => println!("- {id}"),
            }
        }
    });
    discovery
        .run_continuous(Duration::from_secs(10), cancel)
        .await?;
    printer.abort();
    Ok(())
}

async fn cmd_shortcuts(agent: &str) -> Result<()> {
    let (client, _events) = connect(agent).await?;
    let list = client.list_shortcuts().await?;
    if let Some(w) = list.warning {
        eprintln!("warning: {w}");
    }
    if list.shortcuts.is_empty() {
        println!("no shortcuts");
        return Ok(());
    }
    println!("{:<12} {:<24} EXE", "APPID", "NAME");
    for s in list.shortcuts {
        println!("{:<12} {:<24} {}", s.app_id, s.name, s.exe);
    }
    Ok(())
}

async fn cmd_deploy(args: &[String]) -> Result<()> {
    let (agent, dir, name) = match (args.first(), args.get(1), args.get(2)) {
        (Some(a), Some(d), Some(n)) => (a.clone(), PathBuf::from(d), n.clone()),
        _ => return usage_error("deploy needs <agent> <dir> <name>"),
    };
    let exe = match flag_value(args, "--exe") {
        Some(e) => e.to_string(),
        None => return usage_error("deploy needs --exe <rel-path>"),
    };
    let launch_options = flag_value(args, "--launch-options").unwrap_or("").to_string();
    let tags: Vec<String> = flag_value(args, "--tags")
        .map(|t| t.split(',').map(str::to_string).collect())
        .unwrap_or_default();

    let plan = uploader::scan_dir(
        &dir,
        TransferConfig {
            game_name: name.clone(),
            dest_dir: sanitize_dest(&name),
            exe_rel_path: exe,
            launch_options,
            tags,
        },
    )?;
    tracing::info!(
        files = plan.files.len(),
        total_bytes = plan.total_bytes,
        "manifest ready"
    );

    let (client, mut events) = connect(&agent).await?;

    // Relay agent-side progress events while the deploy runs.
    let relay = tokio::spawn(async move {
        while let Some(env) = events.recv().await {
            if env.kind == MessageKind::UploadProgress {
                if let Ok(Some(p)) = env.parse_payload::<UploadProgress>() {
                    tracing::info!(
                        "agent has {}/{} bytes ({:.0} B/s, eta {}s)",
                        p.transferred_bytes,
                        p.total_bytes,
                        p.bytes_per_sec,
                        p.eta_secs
                    );
                }
            }
        }
    });

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_signal.cancel();
        }
    });

    let finished = uploader::deploy(&client, &plan, &cancel).await?;
    relay.abort();
    if !(finished.transfer_ok && finished.shortcut_ok) {
        bail!(
            "deployment failed: {}",
            finished.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    match finished.app_id {
        Some(app_id) => println!("deployed '{name}' as app {app_id}"),
        None => println!("deployed '{name}'"),
    }
    Ok(())
}

/// Destination directory name derived from the game name: lowercase
/// alphanumerics and dashes only.
fn sanitize_dest(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "game".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Find the agent, dial it, and make sure we end up paired, running the
/// interactive code prompt on first contact.
async fn connect(agent: &str) -> Result<(AgentClient, tokio::sync::mpsc::Receiver<Envelope>)> {
    let found = find_agent(agent).await?;
    let addr = found
        .dial_addr()
        .context("agent advertised no usable address")?;

    let state = state_dir();
    let hub_id = load_or_create_identity(&state.join("identity"))?;
    let hub_name = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "gamedock-hub".to_string());
    let mut store = TrustStore::load(state.join("trusted_agents.json"))?;
    let token = store
        .list()
        .into_iter()
        .find(|p| p.id == found.id)
        .map(|p| p.token);

    let (mut client, mut events) = AgentClient::connect(&addr, &hub_id, &hub_name, token).await?;
    tracing::info!(agent = %client.agent().agent_name, paired = client.paired(), "connected");

    if !client.paired() {
        let prompt = wait_pair_prompt(&mut events).await?;
        println!(
            "Pairing required. A {}-digit code is showing on '{}' (valid {}s).",
            dock_core::pairing::CODE_LEN,
            client.agent().agent_name,
            prompt.expires_in_secs
        );
        print!("Enter code: ");
        use std::io::Write;
        std::io::stdout().flush()?;
        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        let result = client.submit_pair_code(line.trim()).await?;
        if !result.success {
            bail!(
                "pairing failed: {}",
                result.reason.unwrap_or_else(|| "rejected".into())
            );
        }
        let token = result.token.context("pairing succeeded without a token")?;
        store.authorize(&found.id, &found.name, &token)?;
        println!("Paired with '{}'.", client.agent().agent_name);
    }
    Ok((client, events))
}

async fn wait_pair_prompt(
    events: &mut tokio::sync::mpsc::Receiver<Envelope>,
) -> Result<PairRequired> {
    let deadline = tokio::time::Instant::now() + dock_core::protocol::REQUEST_TIMEOUT;
    loop {
        let env = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => bail!("agent never offered pairing"),
            env = events.recv() => env.context("connection closed")?,
        };
        if env.kind == MessageKind::PairRequired {
            if let Some(p) = env.parse_payload::<PairRequired>()? {
                return Ok(p);
            }
        }
    }
}

async fn find_agent(id_or_name: &str) -> Result<DiscoveredAgent> {
    let registry = Arc::new(AgentRegistry::new());
    let (discovery, _events) = DiscoveryClient::new(Arc::clone(&registry))?;
    discovery.discover(Duration::from_secs(3)).await?;
    registry
        .find(id_or_name)
        .with_context(|| format!("no agent '{id_or_name}' found; try `dock-hub discover`"))
}

fn state_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gamedock-hub")
}

//! # latch
//!
//! Command-line host for the latch smart doorlock client.
//!
//! ## Running
//!
//! ```bash
//! # Follow the signed-in device's lock status
//! latch watch
//!
//! # Lock over Bluetooth (requires the `bluetooth` feature)
//! latch lock --ble AA:BB:CC:DD:EE:FF
//!
//! # Lock through the backend
//! latch --device smartlock_1 lock
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use latch_core::backend::SettingKey;
use latch_core::ble::adapter::BleAdapter;
use latch_core::{
    FileSessionStore, LatchConfig, LatchError, LockContext, LockState, TungsteniteConnector,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "latch", version, about = "Smart doorlock client")]
struct Cli {
    /// Configuration file (defaults to the platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device to follow, overriding the session and config.
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan for nearby doorlocks.
    Scan {
        /// How long to scan.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Connect to a doorlock and read its characteristics.
    Inspect {
        /// Peripheral address.
        peripheral: String,
    },
    /// Lock the door.
    Lock {
        /// Send over Bluetooth to this peripheral instead of the backend.
        #[arg(long)]
        ble: Option<String>,
    },
    /// Unlock the door.
    Unlock {
        /// Send over Bluetooth to this peripheral instead of the backend.
        #[arg(long)]
        ble: Option<String>,
    },
    /// Fetch the lock status from the backend.
    Status,
    /// Follow realtime lock status until interrupted.
    Watch,
    /// Send Wi-Fi credentials to a doorlock.
    ProvisionWifi {
        /// Peripheral address.
        peripheral: String,
        /// Network name.
        #[arg(long)]
        ssid: String,
        /// Network password.
        #[arg(long)]
        password: String,
    },
    /// Point a doorlock at a backend.
    ProvisionBackend {
        /// Peripheral address.
        peripheral: String,
        /// Backend base URL (defaults to the configured one).
        #[arg(long)]
        url: Option<String>,
    },
    /// Device settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Sign in and remember the session.
    SignIn {
        /// Login email.
        #[arg(long)]
        email: String,
        /// Password.
        #[arg(long)]
        password: String,
    },
    /// Forget the stored session.
    SignOut,
    /// Configuration file helpers.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

impl Command {
    /// Commands that talk to the backend about the followed device. Only
    /// these restore the session and open the realtime channel.
    const fn follows_device(&self) -> bool {
        matches!(
            self,
            Self::Lock { ble: None }
                | Self::Unlock { ble: None }
                | Self::Status
                | Self::Watch
                | Self::Settings { .. }
        )
    }
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    /// Show all settings.
    Get,
    /// Change one setting.
    Set {
        /// `notisEnabled` or `autoLockEnabled`.
        key: SettingKey,
        /// New value.
        #[arg(action = clap::ArgAction::Set)]
        value: bool,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Write a default configuration file.
    Init,
    /// Print the default configuration path.
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Config { action } = &cli.command {
        return run_config(action, cli.config.as_deref());
    }

    let config = LatchConfig::load(cli.config.as_deref())?;
    logging::init(&config.logging, cli.verbose)?;
    debug!(?config, "Configuration loaded");

    let store = Arc::new(FileSessionStore::default_location()?);
    let context = LockContext::new(&config, ble_adapter().await, Arc::new(TungsteniteConnector), store)?;

    if cli.command.follows_device() {
        context.restore_session();
        if let Some(device) = cli.device.clone() {
            context.set_device_id(Some(device));
        }
    }

    let result = run(&context, &config, cli.command, cli.json, cli.config.as_deref()).await;
    context.shutdown().await;
    result
}

async fn run(
    context: &LockContext,
    config: &LatchConfig,
    command: Command,
    json: bool,
    config_path: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    match command {
        Command::Scan { seconds } => {
            context.start_discovery().await;
            let mut shutdown = setup_signal_handlers();
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = &mut shutdown => {}
            }
            context.stop_discovery().await;

            let devices = context.all_devices();
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No doorlocks found");
            } else {
                for device in devices {
                    println!("{}  {}", device.id, device.display_name);
                }
            }
        }
        Command::Inspect { peripheral } => {
            let handle = context.connect_to_device(&peripheral).await?;
            let lock_state = context.read_lock_state().await;
            let mac_address = context.read_mac_address().await;
            let color = *context.subscribe_color().borrow();
            if json {
                let report = serde_json::json!({
                    "connection": handle,
                    "lockState": lock_state,
                    "macAddress": mac_address,
                    "color": color,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Connected to {}", handle.peripheral_id);
                println!("  lock state:  {}", lock_state.as_deref().unwrap_or("-"));
                println!("  mac address: {}", mac_address.as_deref().unwrap_or("-"));
                println!("  color:       {color:?}");
            }
            context.disconnect_from_device(None).await;
        }
        Command::Lock { ble } => send_lock_command(context, ble, true).await?,
        Command::Unlock { ble } => send_lock_command(context, ble, false).await?,
        Command::Status => {
            let state = context.refresh_status().await?;
            if json {
                println!("{}", serde_json::json!({ "deviceId": context.device_id(), "status": state }));
            } else {
                println!("{}", describe(state));
            }
        }
        Command::Watch => watch(context).await?,
        Command::ProvisionWifi {
            peripheral,
            ssid,
            password,
        } => {
            context.connect_to_device(&peripheral).await?;
            context.provision_wifi(&ssid, &password).await;
            context.disconnect_from_device(None).await;
            println!("Sent Wi-Fi credentials for '{ssid}' to {peripheral}");
        }
        Command::ProvisionBackend { peripheral, url } => {
            let url = url.unwrap_or_else(|| config.backend.base_url.clone());
            context.connect_to_device(&peripheral).await?;
            context.provision_backend(&url).await;
            context.disconnect_from_device(None).await;
            println!("Pointed {peripheral} at {url}");
        }
        Command::Settings { action } => match action {
            SettingsAction::Get => {
                let settings = context.fetch_settings().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                } else {
                    for key in [SettingKey::NotisEnabled, SettingKey::AutoLockEnabled] {
                        println!("{:<16} {}", key.as_str(), settings.get(key));
                    }
                }
            }
            SettingsAction::Set { key, value } => match context.update_setting(key, value).await? {
                Some(settings) => println!("{} = {}", key.as_str(), settings.get(key)),
                None => println!("{} = {value}", key.as_str()),
            },
        },
        Command::SignIn { email, password } => {
            let session = context.sign_in(&email, &password).await?;
            match session.device_id() {
                Some(device) => println!("Signed in as {email}, following {device}"),
                None => println!("Signed in as {email}, no device bound to this account"),
            }
        }
        Command::SignOut => {
            context.sign_out();
            println!("Signed out");
        }
        Command::Config { action } => run_config(&action, config_path)?,
    }
    Ok(())
}

async fn send_lock_command(context: &LockContext, ble: Option<String>, lock: bool) -> anyhow::Result<()> {
    if let Some(peripheral) = &ble {
        context.connect_to_device(peripheral).await?;
    } else if context.device_id().is_none() {
        return Err(LatchError::NoDeviceSelected.into());
    }

    let dispatch = if lock {
        context.lock().await
    } else {
        context.unlock().await
    };
    info!(?dispatch, "Command dispatched");
    dispatch.settled().await;

    let verb = if lock { "Lock" } else { "Unlock" };
    match ble {
        Some(peripheral) => {
            context.disconnect_from_device(None).await;
            println!("{verb} sent to {peripheral} over Bluetooth");
        }
        None => println!(
            "{verb} sent to {} through the backend",
            context.device_id().unwrap_or_default()
        ),
    }
    Ok(())
}

async fn watch(context: &LockContext) -> anyhow::Result<()> {
    let Some(device) = context.device_id() else {
        bail!(LatchError::NoDeviceSelected);
    };

    let mut transitions = context.lock_transitions();
    let mut phase = context.subscribe_channel_phase();
    let mut shutdown = setup_signal_handlers();

    println!("Following {device} ({})", describe(context.lock_state()));
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            flip = transitions.next() => match flip {
                Some(true) => println!("Door locked"),
                Some(false) => println!("Door unlocked"),
                None => break,
            },
            changed = phase.changed() => {
                changed.context("realtime channel dropped")?;
                let current = *phase.borrow_and_update();
                info!(phase = ?current, "Realtime channel");
            }
        }
    }
    Ok(())
}

const fn describe(state: LockState) -> &'static str {
    match state {
        LockState::Locked => "locked",
        LockState::Unlocked => "unlocked",
        LockState::Unknown => "unknown",
    }
}

fn run_config(action: &ConfigAction, path: Option<&std::path::Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = LatchConfig::load(path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Init => {
            let target = path
                .map(std::path::Path::to_path_buf)
                .or_else(LatchConfig::default_path)
                .context("cannot determine configuration directory")?;
            if target.exists() {
                bail!("{} already exists", target.display());
            }
            LatchConfig::default().save(&target)?;
            println!("Wrote {}", target.display());
        }
        ConfigAction::Path => match LatchConfig::default_path() {
            Some(path) => println!("{}", path.display()),
            None => bail!("cannot determine configuration directory"),
        },
    }
    Ok(())
}

#[cfg(feature = "bluetooth")]
async fn ble_adapter() -> Option<Arc<dyn BleAdapter>> {
    match latch_core::ble::bluer_backend::BluerAdapter::new().await {
        Ok(adapter) => Some(Arc::new(adapter)),
        Err(e) => {
            warn!(error = %e, "Bluetooth unavailable, BLE commands disabled");
            None
        }
    }
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn ble_adapter() -> Option<Arc<dyn BleAdapter>> {
    warn!("Built without the `bluetooth` feature, BLE commands disabled");
    None
}

/// Resolves on SIGINT or SIGTERM.
fn setup_signal_handlers() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "Signal handlers unavailable, falling back to Ctrl+C");
                    if tokio::signal::ctrl_c().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down");
        }

        let _ = tx.send(());
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["latch", "lock", "--device", "smartlock_1", "--json"]).unwrap();
        assert_eq!(cli.device.as_deref(), Some("smartlock_1"));
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Lock { ble: None }));
    }

    #[test]
    fn test_cli_parses_setting_keys() {
        let cli = Cli::try_parse_from(["latch", "settings", "set", "autoLockEnabled", "false"]).unwrap();
        match cli.command {
            Command::Settings {
                action: SettingsAction::Set { key, value },
            } => {
                assert_eq!(key, SettingKey::AutoLockEnabled);
                assert!(!value);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Cli::try_parse_from(["latch", "settings", "set", "volume", "true"]).is_err());
    }

    #[test]
    fn test_cli_lock_over_ble() {
        let cli = Cli::try_parse_from(["latch", "unlock", "--ble", "AA:BB:CC:DD:EE:FF"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Unlock { ble: Some(ref id) } if id == "AA:BB:CC:DD:EE:FF"
        ));
    }

    fn follows(args: &[&str]) -> bool {
        Cli::try_parse_from(args).unwrap().command.follows_device()
    }

    #[test]
    fn test_only_device_commands_restore_the_session() {
        assert!(follows(&["latch", "status"]));
        assert!(follows(&["latch", "watch"]));
        assert!(follows(&["latch", "lock"]));
        assert!(follows(&["latch", "settings", "get"]));

        assert!(!follows(&["latch", "scan"]));
        assert!(!follows(&["latch", "inspect", "AA:BB:CC:DD:EE:FF"]));
        assert!(!follows(&["latch", "lock", "--ble", "AA:BB:CC:DD:EE:FF"]));
        assert!(!follows(&["latch", "sign-out"]));
    }

    #[test]
    fn test_describe_states() {
        assert_eq!(describe(LockState::Locked), "locked");
        assert_eq!(describe(LockState::Unknown), "unknown");
    }
}

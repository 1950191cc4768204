use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use trash2cash::clock::SystemClock;
use trash2cash::config::Config;
use trash2cash::gateway::{self, AppState};
use trash2cash::ledger::Material;
use trash2cash::pairing::{render_terminal, token_prefix};
use trash2cash::station::{SimulatedSensor, StationFacade};
use trash2cash::store::Store;
use trash2cash::StationError;

/// How often `issue --wait` polls the session.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "trash2cash")]
#[command(version, about = "Recycling station pairing and reward ledger", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway for mobile devices and remote stations
    Serve {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,

        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Register a user (prompts for the password)
    Register {
        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        email: String,
    },

    /// Issue a session token and print its QR code
    Issue {
        /// Keep polling until a user binds or the token expires
        #[arg(short, long)]
        wait: bool,
    },

    /// Show the status of a session token
    Status { token: String },

    /// Delete expired sessions
    Sweep,

    /// Print reward rates per kilogram
    Rates,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "trash2cash=debug"
    } else {
        "trash2cash=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            gateway::run_gateway(config).await?;
        }
        Commands::Register { name, email } => {
            let secret = dialoguer::Password::new()
                .with_prompt("Password")
                .with_confirmation("Confirm password", "Passwords do not match")
                .interact()?;
            let state = open_state(&config)?;
            let user = state.coordinator.accounts().register(&name, &email, &secret)?;
            println!("Registered {} <{}> as user {}", user.name, user.email, user.id);
        }
        Commands::Issue { wait } => {
            let store = open_store(&config)?;
            let station = StationFacade::from_config(
                &config,
                store,
                Arc::new(SystemClock),
                Box::new(SimulatedSensor::new()),
            );
            let issued = station.request_token()?;
            println!("{}", render_terminal(&issued.qr_payload)?);
            println!("Token:   {}", issued.token);
            println!("Payload: {}", issued.qr_payload);
            println!("Expires: {}", issued.expires_at.to_rfc3339());

            if wait {
                wait_for_binding(&station, &issued.token).await?;
            }
        }
        Commands::Status { token } => {
            let state = open_state(&config)?;
            match state.coordinator.poll_status(&token) {
                Ok(poll) => {
                    println!("Status: {}", poll.status);
                    if let Some(identity) = poll.identity {
                        println!(
                            "User:   {} <{}> (id {}, balance {:.2})",
                            identity.name, identity.email, identity.id, identity.balance
                        );
                    }
                }
                Err(StationError::Expired) => println!("Status: expired"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Sweep => {
            let state = open_state(&config)?;
            let removed = state.coordinator.sweep()?;
            println!("Removed {removed} expired session(s)");
        }
        Commands::Rates => {
            for material in Material::ALL {
                println!("{:<8} {:>8.0} / kg", material.as_str(), material.rate());
            }
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<Store>> {
    let path = config.db_path()?;
    let store = Store::open(&path).context("Failed to open station database")?;
    Ok(Arc::new(store))
}

fn open_state(config: &Config) -> Result<AppState> {
    Ok(AppState::from_config(
        config,
        open_store(config)?,
        Arc::new(SystemClock),
    ))
}

async fn wait_for_binding(station: &StationFacade, token: &str) -> Result<()> {
    tracing::info!(token = token_prefix(token), "Waiting for a mobile user to bind");
    loop {
        match station.check_status() {
            Ok(poll) if poll.is_authenticated() => {
                let user = station.current_user()?;
                println!(
                    "Connected: {} <{}> (balance {:.2})",
                    user.name, user.email, user.balance
                );
                return Ok(());
            }
            Ok(_) => tokio::time::sleep(POLL_INTERVAL).await,
            Err(StationError::Expired) => bail!("Session expired before a user connected"),
            Err(e) => return Err(e.into()),
        }
    }
}

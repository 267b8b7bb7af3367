//! secretd - an agent to manage secrets.
//!
//! Subcommands mirror the agent's routes and work in two modes: against a
//! running agent through its Unix socket (`--socket`), or directly against
//! a local catalog and journal database. `serve` runs the agent itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use secretd_core::error::{Error, ErrorBody, Result};
use secretd_core::lifecycle::DEFAULT_MAX_REASON_LEN;
use secretd_core::{
    config, Environment, Journal, LifecycleController, OperationName, OperationParameters, Range,
    SecretStore,
};
use secretd_daemon::{local_principal, serve, ServerConfig};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod client;

use client::SecretClient;

/// secretd - an agent to manage secrets.
#[derive(Parser, Debug)]
#[command(name = "secretd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the agent socket; without it commands run against a local
    /// journal
    #[arg(short = 's', long, env = "SOCKET", global = true)]
    socket: Option<PathBuf>,

    /// Path to the secrets catalog file
    #[arg(short = 'S', long, env = "SECRETS_FILE", global = true)]
    secrets_file: Option<PathBuf>,

    /// Path to the journal database file
    #[arg(short = 'b', long, default_value = "./secrets.db", global = true)]
    db_file: PathBuf,

    /// Pretty-print JSON output
    #[arg(short = 'p', long, global = true)]
    pretty: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List secrets
    Secrets,

    /// Show a secret
    Secret {
        /// Secret id
        secret: String,
    },

    /// List secret instances
    Instances {
        /// Secret id
        secret: String,
        #[command(flatten)]
        range: RangeArgs,
    },

    /// Show a secret instance
    Instance {
        /// Secret id
        secret: String,
        /// Instance id
        instance: String,
    },

    /// Show the active instance of a secret
    Active {
        /// Secret id
        secret: String,
    },

    /// Show the operation history of a secret or of one instance
    History {
        /// Secret id
        secret: String,
        /// Instance id; omit for the whole secret
        instance: Option<String>,
        #[command(flatten)]
        range: RangeArgs,
    },

    /// Create a secret instance
    Create {
        /// Secret id
        secret: String,
        #[command(flatten)]
        operation: OperationArgs,
    },

    /// Destroy a secret instance
    Destroy {
        /// Secret id
        secret: String,
        /// Instance id
        instance: String,
        #[command(flatten)]
        operation: OperationArgs,
    },

    /// Activate a secret instance
    Activate {
        /// Secret id
        secret: String,
        /// Instance id
        instance: String,
        #[command(flatten)]
        operation: OperationArgs,
    },

    /// Deactivate a secret instance
    Deactivate {
        /// Secret id
        secret: String,
        /// Instance id
        instance: String,
        #[command(flatten)]
        operation: OperationArgs,
    },

    /// Test an active secret instance
    Test {
        /// Secret id
        secret: String,
        /// Instance id
        instance: String,
        #[command(flatten)]
        operation: OperationArgs,
    },

    /// Run the agent
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone, Copy)]
struct RangeArgs {
    /// First index, inclusive
    #[arg(short = 'l', long, default_value_t = 0)]
    from: u32,

    /// Last index, exclusive
    #[arg(short = 'u', long, default_value_t = 10)]
    to: u32,
}

impl From<RangeArgs> for Range {
    fn from(args: RangeArgs) -> Self {
        Self {
            from: args.from,
            to: args.to,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct OperationArgs {
    /// Bypass admission guards; the operation is still recorded as forced
    #[arg(short = 'f', long)]
    force: bool,

    /// Reason recorded with the operation
    #[arg(short = 'r', long, default_value = "")]
    reason: String,
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Path to the permissions document
    #[arg(short = 'P', long, env = "PERMISSIONS_FILE")]
    permissions_file: PathBuf,

    /// Requests admitted per principal per window; 0 disables limiting
    #[arg(long, default_value_t = 0)]
    request_limit: u32,

    /// Rate limit window in seconds; 0 disables limiting
    #[arg(long, default_value_t = 0)]
    request_window: u64,

    /// Maximum operation reason length in bytes; 0 disables the check
    #[arg(long, default_value_t = DEFAULT_MAX_REASON_LEN)]
    max_reason_length: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let pretty = cli.pretty;
    if let Err(err) = run(cli).await {
        print_json(&ErrorBody::from(&err), pretty);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(ref args) => {
            let args = args.clone();
            run_agent(&cli, args).await
        }
        ref command => {
            let store = new_store(&cli)?;
            let started_by = resolve_started_by(cli.socket.is_some())?;
            run_command(store.as_ref(), command, &started_by, cli.pretty).await
        }
    }
}

/// Builds the store behind the subcommands: an HTTP client when a socket is
/// given, otherwise the journal-backed controller over local files.
fn new_store(cli: &Cli) -> Result<Arc<dyn SecretStore>> {
    if let Some(socket) = &cli.socket {
        return Ok(Arc::new(SecretClient::new(socket.clone())));
    }
    let secrets_file = cli
        .secrets_file
        .as_ref()
        .ok_or_else(|| Error::BadConfig("no socket and no secrets file".to_string()))?;
    let catalog = config::load_secrets(secrets_file)?;
    let journal = Journal::open(&cli.db_file)?;
    Ok(Arc::new(LifecycleController::new(
        journal,
        catalog,
        DEFAULT_MAX_REASON_LEN,
        CancellationToken::new(),
    )))
}

async fn run_command(
    store: &dyn SecretStore,
    command: &Commands,
    started_by: &str,
    pretty: bool,
) -> Result<()> {
    match command {
        Commands::Secrets => print_json(&store.list_secrets().await?, pretty),
        Commands::Secret { secret } => print_json(&store.get_secret(secret).await?, pretty),
        Commands::Instances { secret, range } => {
            print_json(&store.list_instances(secret, (*range).into()).await?, pretty);
        }
        Commands::Instance { secret, instance } => {
            print_json(&store.get_instance(secret, instance).await?, pretty);
        }
        Commands::Active { secret } => print_json(&store.get_active(secret).await?, pretty),
        Commands::History {
            secret,
            instance,
            range,
        } => match instance {
            Some(instance) => print_json(
                &store
                    .instance_history(secret, instance, (*range).into())
                    .await?,
                pretty,
            ),
            None => print_json(&store.secret_history(secret, (*range).into()).await?, pretty),
        },
        Commands::Create { secret, operation } => {
            print_json(
                &store.create(secret, parameters(operation, started_by)).await?,
                pretty,
            );
        }
        Commands::Destroy {
            secret,
            instance,
            operation,
        } => {
            run_operation(
                store, secret, instance, OperationName::Destroy, operation, started_by, pretty,
            )
            .await?;
        }
        Commands::Activate {
            secret,
            instance,
            operation,
        } => {
            run_operation(
                store, secret, instance, OperationName::Activate, operation, started_by, pretty,
            )
            .await?;
        }
        Commands::Deactivate {
            secret,
            instance,
            operation,
        } => {
            run_operation(
                store, secret, instance, OperationName::Deactivate, operation, started_by, pretty,
            )
            .await?;
        }
        Commands::Test {
            secret,
            instance,
            operation,
        } => {
            run_operation(
                store, secret, instance, OperationName::Test, operation, started_by, pretty,
            )
            .await?;
        }
        Commands::Serve(_) => unreachable!("serve is dispatched in run"),
    }
    Ok(())
}

async fn run_operation(
    store: &dyn SecretStore,
    secret: &str,
    instance: &str,
    name: OperationName,
    operation: &OperationArgs,
    started_by: &str,
    pretty: bool,
) -> Result<()> {
    let instance = store
        .operate(secret, instance, name, parameters(operation, started_by))
        .await?;
    print_json(&instance, pretty);
    Ok(())
}

/// The principal stamped on operations run in-process.
///
/// Only the journal-backed path consumes it: over the socket the field is
/// never sent and the agent resolves the caller from peer credentials, so
/// the client's own uid need not have a passwd entry at all.
fn resolve_started_by(socket_mode: bool) -> Result<String> {
    if socket_mode {
        Ok(String::new())
    } else {
        local_principal()
    }
}

/// Operation parameters from the flags and the caller's own environment.
fn parameters(args: &OperationArgs, started_by: &str) -> OperationParameters {
    OperationParameters {
        env: Environment::load(std::env::vars().map(|(k, v)| format!("{k}={v}"))),
        forced: args.force,
        reason: args.reason.clone(),
        started_by: started_by.to_string(),
    }
}

async fn run_agent(cli: &Cli, args: ServeArgs) -> Result<()> {
    let secrets_file = cli
        .secrets_file
        .as_ref()
        .ok_or_else(|| Error::BadConfig("no secrets file".to_string()))?;
    let catalog = config::load_secrets(secrets_file)?;
    let permissions = config::load_permissions(&args.permissions_file)?;
    let journal = Journal::open(&cli.db_file)?;

    let token = CancellationToken::new();
    let controller = LifecycleController::new(
        journal.clone(),
        catalog,
        args.max_reason_length,
        token.clone(),
    );

    for operation in journal.in_flight_operations()? {
        info!(
            operation = operation.id,
            secret = %operation.secret_id,
            instance = %operation.instance_id,
            name = %operation.status.name,
            "found interrupted operation; operator intervention may be needed"
        );
    }

    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutting down");
        signal_token.cancel();
    });

    let config = ServerConfig {
        socket: cli.socket.clone(),
        request_limit: args.request_limit,
        request_window: Duration::from_secs(args.request_window),
    };
    serve(config, Arc::new(controller), permissions, token)
        .await
        .map_err(|e| Error::BadConfig(e.to_string()))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install signal handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install signal handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("failed to render output: {err}"),
    }
}

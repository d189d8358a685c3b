use clap::{Parser, Subcommand};
use engineio::{Connection, Server, Socket, SocketEvent, SocketEvents};

#[derive(Parser)]
#[command(name = "eio")]
#[command(about = "engine.io server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Serve an echo endpoint: every message a client sends is sent back to it.
    Serve {
        /// Config file path (default: ENGINEIO_CONFIG_PATH or ~/.engineio/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP and WebSocket port (default from config or 3000)
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("eio {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("serve failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = engineio::load_config(config_path)?;
    if let Some(p) = port {
        config.server.port = p;
    }
    log::info!(
        "starting engine on {}:{} (config {})",
        config.server.bind,
        config.server.port,
        path.display()
    );

    let (server, mut incoming) = Server::new(config.engine.clone());
    tokio::spawn(async move {
        while let Some(Connection { socket, events }) = incoming.recv().await {
            log::info!("client {} connected over {}", socket.id(), socket.transport_kind());
            tokio::spawn(echo(socket, events));
        }
    });

    server.serve(&config.server, shutdown_signal()).await
}

async fn echo(socket: Socket, mut events: SocketEvents) {
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Message { data, binary: true } => socket.send_binary(data),
            SocketEvent::Message { data, binary: false } => {
                socket.send(String::from_utf8_lossy(&data).into_owned())
            }
            SocketEvent::Upgrade(kind) => {
                log::info!("client {} upgraded to {}", socket.id(), kind);
            }
            SocketEvent::Close {
                reason,
                description,
            } => {
                match description {
                    Some(d) => log::info!("client {} closed: {} ({})", socket.id(), reason, d),
                    None => log::info!("client {} closed: {}", socket.id(), reason),
                }
                break;
            }
            _ => {}
        }
    }
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

use clap::Parser;
use log::{error, info};
use server::network::Server;
use tokio::sync::mpsc;

/// Main-method of the application.
/// Parses command-line arguments, starts the display sink and runs the accept loop until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = shared::DEFAULT_HOST)]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
        port: u16,
    }

    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    // Local display sink; printing happens off the session tasks
    let (display_tx, mut display_rx) = mpsc::unbounded_channel::<String>();
    let display = tokio::spawn(async move {
        while let Some(line) = display_rx.recv().await {
            println!("{}", line);
        }
    });

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, display_tx).await?;

    server
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => {
                    error!("Unable to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await
                }
            }
        })
        .await?;

    // The sink closes once the server and its sessions are gone
    if let Err(e) = display.await {
        error!("Display task failed: {}", e);
    }

    Ok(())
}

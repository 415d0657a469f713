use clap::Parser;
use client::network::ChatClient;
use log::info;
use tokio::io::BufReader;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:12345")]
    server: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Type a line and press Enter to send it, Ctrl+D to leave");

    let client = ChatClient::connect(&args.server).await?;
    info!("Chatting on {}", client.server_addr());

    let (display_tx, mut display_rx) = mpsc::unbounded_channel::<String>();
    let display = tokio::spawn(async move {
        while let Some(line) = display_rx.recv().await {
            println!("{}", line);
        }
    });

    client
        .run(BufReader::new(tokio::io::stdin()), display_tx)
        .await?;

    display.await?;

    // A blocking stdin read may still be pending and would hold the runtime open
    std::process::exit(0)
}

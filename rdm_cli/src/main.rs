use std::path::PathBuf;

use clap::Parser;

use rdm_core::{DownloadItem, DownloadSettings, Engine, FileInfoProbe};

mod terminal_observer;
use terminal_observer::TerminalProgressObserver;

#[derive(Parser)]
#[command(name = "rdm", about = "Rust Download Manager")]
struct Args {
    /// URL to download
    #[arg(short, long, default_value = "https://proof.ovh.net/files/1Mb.dat")]
    url: String,

    /// Directory to save the finished file into
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Number of connections to split the download across
    #[arg(short, long, default_value = "8")]
    connections: usize,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let client = reqwest::Client::new();
    let info = match FileInfoProbe::probe(&client, &args.url).await {
        Ok(info) => info,
        Err(e) => {
            eprintln!("failed to probe {}: {}", args.url, e);
            std::process::exit(1);
        }
    };

    let settings = DownloadSettings {
        total_connections: if info.supports_pause { args.connections } else { 1 },
        base_save_dir: args.output,
        ..DownloadSettings::default()
    };
    let item = DownloadItem::new(info.file_name.clone(), settings.base_save_dir.join(&info.file_name), args.url.clone(), info.content_length);

    let (engine, mut events) = Engine::spawn(client);
    let observer = TerminalProgressObserver::new();

    println!("Starting download: {} ({} bytes)", args.url, info.content_length);
    engine.start(item, settings).await;

    while let Some(progress) = events.recv().await {
        let done = observer.on_progress(&progress);
        if done {
            break;
        }
    }
}

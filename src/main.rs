use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use time::macros::format_description;
use tracing::Level;
use tracing_appender::non_blocking;
use tracing_subscriber::fmt::time::LocalTime;

use bitpiece::ClientConfig;
use bitpiece::cmd::Command;

#[derive(Parser, Debug)]
#[command(name = "bitpiece", version)]
struct Args {
    #[arg(long, value_parser = parse_peer_id, help = "20-byte peer id (random if omitted)")]
    peer_id: Option<[u8; 20]>,

    #[arg(long, default_value_t = 6881, help = "Port advertised to the tracker")]
    port: u16,

    #[arg(long, default_value_t = 5, help = "Bound on every network operation, in seconds")]
    timeout_secs: u64,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    #[arg(short, action = clap::ArgAction::Count, help = "Log at DEBUG (-v) or TRACE (-vv)")]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

fn parse_peer_id(s: &str) -> Result<[u8; 20], String> {
    s.as_bytes().try_into().map_err(|_| format!("peer id must be exactly 20 bytes, got {}", s.len()))
}

impl Args {
    fn config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            port: self.port,
            timeout: Duration::from_secs(self.timeout_secs),
            ..ClientConfig::default()
        };
        if let Some(peer_id) = self.peer_id {
            config.peer_id = peer_id;
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let file_appender = tracing_appender::rolling::never(&args.log_dir, "bitpiece.log");
    let (non_blocking, _guard) = non_blocking(file_appender);
    let timer = LocalTime::new(format_description!(
        "[month]/[day]/[year] [hour repr:24]:[minute]:[second].[subsecond digits:4]"
    ));
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_timer(timer)
        .with_max_level(level)
        .init();

    let config = args.config();
    let cancel = config.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling sessions");
            cancel.cancel();
        }
    });

    match args.command.execute(&config).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, kind = ?e.kind(), "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

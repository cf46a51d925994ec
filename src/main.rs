use clap::Parser;
use tracing_subscriber::EnvFilter;

use otaextract::cmd::Cmd;

fn main() {
    let filter = EnvFilter::try_from_env("OTAEXTRACT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cmd::parse().run() {
        eprintln!("\nERROR: {:#}", e);
        std::process::exit(1);
    }
}

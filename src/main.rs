use clap::Parser;
use tracing_subscriber::EnvFilter;

use redwire::config::Config;
use redwire::server::event_loop;

fn main() {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = event_loop::run(config) {
        tracing::error!("fatal: {e}");
        std::process::exit(1);
    }
}

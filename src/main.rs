//! Binary entry point: parse the port, init logging, run the relay.

use clap::Parser;

use crdt_relay::server::{RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "crdt-relay", version, about = "Collaborative-document relay server")]
struct Args {
    /// TCP port to listen on.
    #[arg(value_parser = clap::value_parser!(u16).range(1..), default_value_t = 9000)]
    port: u16,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = RelayConfig {
        bind_addr: format!("0.0.0.0:{}", args.port),
        ..RelayConfig::default()
    };

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("server failed: {e}");
        std::process::exit(1);
    }
}

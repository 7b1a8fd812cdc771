//! Process entry point: load configuration, initialize tracing, bind and
//! serve. Grounded on the teacher's `lib.rs::run` startup sequence
//! (panic hook, `db::init`, `logger::init`, `server::spawn`) adapted from an
//! embedded Tauri app's background-thread server spawn to a plain
//! `#[tokio::main]` binary, since this crate has no desktop shell around it.

use relay_gateway::config::GatewayConfig;
use relay_gateway::logger;

#[tokio::main]
async fn main() {
    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    logger::init_tracing(&config.log_level());

    std::panic::set_hook(Box::new(|panic_info| {
        tracing::error!(panic = %panic_info, "panic in relay gateway");
    }));

    if let Err(err) = relay_gateway::server::serve(config).await {
        tracing::error!(error = %err, "relay gateway exited with an error");
        std::process::exit(1);
    }
}

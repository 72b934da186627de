use std::io;
use std::time::Duration;

use log::info;

use dipc::{protocol, CommandSet, ServerBuilder, ServerConfig};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let config = ServerConfig::from_env();
    let mut server = ServerBuilder::new(config)
        .handler(CommandSet::Dump, |message, stream| {
            info!(
                "Dump request, command {:#04x}, {} payload bytes",
                message.header.command,
                message.payload.len()
            );
            protocol::write_message(stream, &protocol::ok_message(), Some(REPLY_TIMEOUT))
        })
        .handler(CommandSet::EventPipe, |message, stream| {
            info!("Event pipe request, command {:#04x}", message.header.command);
            protocol::write_message(stream, &protocol::ok_message(), Some(REPLY_TIMEOUT))
        })
        .spawn()
        .expect("Failed to start diagnostics server");

    match server.rendezvous_path() {
        Some(path) => info!("Diagnostics available at {}", path.display()),
        None => info!("Diagnostics disabled via DIPC_ENABLE"),
    }

    info!("Press enter to stop");
    let mut line = String::new();
    let _ = io::stdin().read_line(&mut line);

    server.shutdown();
    info!("Server stopped");
}

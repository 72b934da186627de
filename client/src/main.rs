use std::env;
use std::process;
use std::time::Duration;

use log::info;

use dipc::protocol::{self, SERVER_OK};
use dipc::{CommandSet, IpcListener, Message};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = env::args().skip(1);
    let address = match args.next() {
        Some(address) => address,
        None => {
            eprintln!("usage: dipc-client <socket-path> [dump|eventpipe|profiler]");
            process::exit(2);
        }
    };
    let set = match args.next().as_deref().unwrap_or("dump") {
        "dump" => CommandSet::Dump,
        "eventpipe" => CommandSet::EventPipe,
        "profiler" => CommandSet::Profiler,
        other => {
            eprintln!("unknown command set: {other}");
            process::exit(2);
        }
    };

    info!("Connecting to {address}");
    let endpoint = IpcListener::client(&address);
    let mut stream = endpoint
        .connect(Some(dipc::log_failure))
        .expect("Failed to connect to the diagnostics server");

    let request = Message::new(set, 0x01, Vec::new()).expect("Failed to build request");
    protocol::write_message(&mut stream, &request, Some(COMMAND_TIMEOUT))
        .expect("Failed to send request");
    info!("Sent {set:?} command, waiting for the reply");

    let reply = protocol::read_message(&mut stream, Some(COMMAND_TIMEOUT))
        .expect("Failed to read reply");
    if reply.header.command_set == CommandSet::Server as u8 && reply.header.command == SERVER_OK {
        info!("Server acknowledged the command");
    } else if reply.payload.len() >= 4 {
        let code = u32::from_le_bytes([
            reply.payload[0],
            reply.payload[1],
            reply.payload[2],
            reply.payload[3],
        ]);
        info!("Server replied with error {code:#010x}");
    } else {
        info!(
            "Server replied with command set {:#04x} command {:#04x}",
            reply.header.command_set, reply.header.command
        );
    }

    stream.close(Some(dipc::log_failure));
}

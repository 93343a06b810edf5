//! Supervisor Binary
//!
//! Stands up one supervisor on the configured socket and serves until
//! torn down. Location and backend come from the environment: see
//! [`ServerConfig::from_env`].

use std::process::ExitCode;

use rewind::{logger, Server, ServerConfig};

fn main() -> ExitCode {
    logger::init();
    let config = ServerConfig::from_env();
    let server = match Server::spawn(config) {
        Ok(server) => server,
        Err(status) => {
            log::error!("supervisor startup failed: {}", status);
            return ExitCode::FAILURE;
        }
    };
    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(status) => {
            log::error!("supervisor terminated: {}", status);
            ExitCode::FAILURE
        }
    }
}

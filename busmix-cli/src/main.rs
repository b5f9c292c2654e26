//! # busmix
//!
//! Offline scene runner for the busmix mix engine.

use log::error;

mod cli;
mod error;
mod logging;
mod runner;
mod scene;

fn main() {
    let log_buffer = logging::init();
    let args = cli::args::build_cli().get_matches();

    let code = match runner::run(&args, &log_buffer) {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            eprintln!("error: {}", err);
            1
        }
    };

    std::process::exit(code)
}

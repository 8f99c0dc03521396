//! JobHub request layer CLI.
//!
//! Issues requests against a JobHub backend through the request layer, which makes caching,
//! retries, timeouts and the circuit breaker observable from the command line.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;

use jobhub_client::logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

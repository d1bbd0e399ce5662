//! Entry point for the command-line interface.
#![forbid(unsafe_code)]

use std::process::ExitCode;

#[expect(
    clippy::print_stderr,
    reason = "top-level errors are reported before the logger may exist"
)]
fn main() -> ExitCode {
    match mapsync_cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("mapsync: {err}");
            ExitCode::FAILURE
        }
    }
}

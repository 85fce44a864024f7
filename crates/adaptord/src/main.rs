//! Binary entrypoint for the adaptor daemon.

use std::io::{self, Write};
use std::process::ExitCode;

use adaptor_config::ConfigError;
use adaptord::{BootstrapError, LaunchError, run_daemon};

fn main() -> ExitCode {
    match run_daemon() {
        Ok(()) => ExitCode::SUCCESS,
        Err(LaunchError::Bootstrap(BootstrapError::Configuration {
            source: ConfigError::Cli { source },
        })) => {
            source.print().ok();
            ExitCode::from(u8::try_from(source.exit_code()).unwrap_or(2))
        }
        Err(error) => {
            writeln!(io::stderr().lock(), "adaptord: {error}").ok();
            ExitCode::FAILURE
        }
    }
}

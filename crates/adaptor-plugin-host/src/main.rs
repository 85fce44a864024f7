//! Binary entrypoint for the forked-tier plugin host.

use std::io::{self, Write};
use std::process::ExitCode;

use adaptor_plugin_host::{HostError, init_logging, parse_args, run};

fn main() -> ExitCode {
    let args = match parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(HostError::Args(error)) => error.exit(),
        Err(error) => return fail(&error),
    };
    if let Err(error) = init_logging(&args.log_filter, args.log_format) {
        return fail(&error);
    }

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    match run(&args, &mut reader, &mut writer) {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => fail(&error),
    }
}

fn fail(error: &HostError) -> ExitCode {
    writeln!(io::stderr().lock(), "adaptor-plugin-host: {error}").ok();
    ExitCode::from(error.exit_code())
}

mod cli;
mod commands;
mod logging;
mod output;
mod registry;

use clap::Parser;
use cli::{Cli, Command};
use whodb_core::{AppConfig, EngineError};

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are not usage errors.
            if e.use_stderr() {
                let _ = e.print();
                std::process::exit(1);
            }
            let _ = e.print();
            std::process::exit(0);
        }
    };

    let mut config = AppConfig::from_env();
    if !matches!(cli.command, Command::Serve { .. }) {
        config.cli_mode = true;
    }
    whodb_core::init_app_config(config.clone());
    logging::init(&config, cli.quiet);

    if let Err(e) = commands::run(cli, &config) {
        eprintln!("error: {e}");
        std::process::exit(exit_code(&e));
    }
}

/// Exit codes: 1 usage/input, 2 connection, 3 execution.
fn exit_code(error: &EngineError) -> i32 {
    match error {
        EngineError::InvalidArgument(_) | EngineError::PayloadTooLarge(_) => 1,
        EngineError::Unauthorized(_) | EngineError::Unavailable(_) => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(exit_code(&EngineError::invalid_argument("bad flag")), 1);
        assert_eq!(exit_code(&EngineError::unavailable("refused")), 2);
        assert_eq!(exit_code(&EngineError::unauthorized("denied")), 2);
        assert_eq!(exit_code(&EngineError::conflict("dup")), 3);
        assert_eq!(exit_code(&EngineError::internal("boom")), 3);
    }
}

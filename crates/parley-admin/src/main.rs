//! `parley-admin`: operational commands for a Parley store.

#![deny(unsafe_code)]

use std::process::ExitCode;

use clap::Parser;
use parley_admin::{Cli, run};
use parley_logging::{LogFormat, init_subscriber};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_subscriber(&cli.log_level, LogFormat::parse(&cli.log_format).unwrap_or_default());

    match run(&cli) {
        Ok(output) => {
            match serde_json::to_string_pretty(&output.report) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("error: cannot encode report: {e}");
                    return ExitCode::FAILURE;
                }
            }
            if output.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

use std::io::{stdin, stdout, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use executor::{eval, Control};
use session::Session;

mod builtins;
mod config;
mod error;
mod executor;
mod job;
mod parser;
mod session;
mod signals;

fn main() -> ExitCode {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tsh: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config) -> Result<()> {
    let session = Session::install().context("installing signal handlers")?;

    let mut input = String::new();
    loop {
        if config.emit_prompt() {
            create_prompt(&config.prompt)?;
        }

        input.clear();
        if stdin().read_line(&mut input).context("reading command line")? == 0 {
            // End of input (ctrl-d)
            println!();
            return Ok(());
        }
        let command = input.strip_suffix('\n').unwrap_or(&input);

        match eval(&session, command) {
            Ok(Control::Continue) => {}
            Ok(Control::Quit) => return Ok(()),
            // Already reported under the gate.
            Err(e) => debug!(%e, "command failed"),
        }
        stdout().flush()?;
    }
}

fn create_prompt(prompt: &str) -> Result<()> {
    let mut out = stdout().lock();
    write!(out, "{prompt}")?;
    out.flush()?;
    Ok(())
}

use clap::Parser;

/// A tiny shell with job control.
#[derive(Debug, Clone, Parser)]
#[command(name = "tsh", version)]
pub struct Config {
    /// Emit additional diagnostic information
    #[arg(short, long)]
    pub verbose: bool,

    /// Do not print a prompt
    #[arg(short = 'p', long = "no-prompt")]
    pub no_prompt: bool,

    /// Prompt printed before each command line
    #[arg(long, env = "TSH_PROMPT", default_value = "tsh> ")]
    pub prompt: String,
}

impl Config {
    pub fn emit_prompt(&self) -> bool {
        !self.no_prompt
    }

    /// Log filter used when `RUST_LOG` is unset.
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "tsh=debug"
        } else {
            "warn"
        }
    }
}

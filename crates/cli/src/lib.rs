pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "negocia",
    about = "Negocia operator CLI",
    long_about = "Inspect Negocia configuration and talk to the negotiation agent from a terminal.",
    after_help = "Examples:\n  negocia config\n  negocia chat --user 5511999990000"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Run an interactive negotiation over stdin/stdout against the live services")]
    Chat {
        #[arg(long, default_value = "terminal", help = "User id that owns the conversation")]
        user: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Chat { user } => commands::chat::run(&user),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

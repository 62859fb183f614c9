use std::process::ExitCode;

fn main() -> ExitCode {
    negocia_cli::run()
}

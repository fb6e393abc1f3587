use std::process::ExitCode;

fn main() -> ExitCode {
    charter_cli::run()
}

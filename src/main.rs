use std::process::ExitCode;

fn main() -> ExitCode {
    ExitCode::from(pgplan::cli::run() as u8)
}

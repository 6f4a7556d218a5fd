use std::process::ExitCode;

fn main() -> ExitCode {
    caseflow_cli::run()
}

// Standalone realm worker: one job on stdin, one report on stdout
use std::process::ExitCode;

fn main() -> ExitCode {
    match codelab_sandbox::worker::serve_stdio() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("realm worker: {:#}", e);
            ExitCode::from(2)
        }
    }
}

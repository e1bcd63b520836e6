use std::process::ExitCode;

fn main() -> ExitCode {
    match ytdlp_desk_lib::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

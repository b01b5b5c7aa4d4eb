use std::process::ExitCode;

use ferry::BridgeError;

pub type CliResult<T> = anyhow::Result<T>;

/// Exit status when the host answered but rejected the call
const REJECTED: u8 = 2;

/// Convert a CliResult to an ExitCode, printing errors to stderr
pub fn to_exit_code(result: CliResult<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            match e.downcast_ref::<BridgeError>() {
                Some(BridgeError::Rejected(_)) => ExitCode::from(REJECTED),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

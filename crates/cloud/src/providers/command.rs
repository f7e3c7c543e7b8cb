//! External command execution shared by the CLI-backed providers.

use tokio::process::Command;
use tracing::debug;

use super::traits::ProviderError;

/// Run `program args...` and return its trimmed stdout.
///
/// # Errors
///
/// Returns [`ProviderError::Command`] if the program cannot be spawned or
/// exits non-zero; the error carries the program's stderr.
pub async fn run_captured(program: &str, args: &[&str]) -> Result<String, ProviderError> {
    // Arguments may carry record values but never credentials.
    debug!(program, args = %args.join(" "), "Running command");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ProviderError::Command {
            program: program.to_string(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProviderError::Command {
            program: program.to_string(),
            message: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_command_error() {
        let err = run_captured("jld-definitely-not-installed", &["--version"])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Command { ref program, .. } if program == "jld-definitely-not-installed"
        ));
    }
}

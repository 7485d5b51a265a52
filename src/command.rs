use crate::error::GpuConfError;
use anyhow::Result;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Absolute path of `name` from `PATH`, or the bare name when it cannot be
/// resolved (the spawn error then reports the missing binary).
pub fn resolve_binary(name: &str) -> PathBuf {
    which::which(name).unwrap_or_else(|_| PathBuf::from(name))
}

/// Runs `program` with `args` and returns its stdout. Non-zero exits carry
/// the captured stderr.
pub fn run_capture<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let bin = resolve_binary(program);
    let mut cmd = Command::new(&bin);
    cmd.args(args);
    debug!(command = ?cmd, "running");

    let output = cmd.output().map_err(|source| GpuConfError::Start {
        program: bin.display().to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(GpuConfError::exec(program, output.status.code(), &output.stderr).into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Collapses a captured output to one trimmed line.
pub fn single_line(raw: &str) -> String {
    raw.replace('\n', "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_joins_and_trims() {
        assert_eq!(single_line("  535.129.03\n"), "535.129.03");
        assert_eq!(single_line("6.6.8-macaroni\n\n"), "6.6.8-macaroni");
    }

    #[test]
    fn missing_binary_fails_to_start() {
        let err = run_capture("gpuconf-no-such-binary", ["-r"]).unwrap_err();
        assert!(err.to_string().contains("failed to start"));
        assert!(matches!(
            err.downcast_ref::<GpuConfError>(),
            Some(GpuConfError::Start { .. })
        ));
    }

    #[test]
    fn non_zero_exit_carries_stderr() {
        let err = run_capture("sh", ["-c", "echo boom >&2; exit 3"]).unwrap_err();
        match err.downcast_ref::<GpuConfError>() {
            Some(GpuConfError::Exec {
                program,
                code,
                stderr,
            }) => {
                assert_eq!(program, "sh");
                assert_eq!(code, "3");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.to_string(), "sh exited with 3: boom");
    }

    #[test]
    fn captures_stdout() {
        let out = run_capture("sh", ["-c", "echo 6.6.13-macaroni"]).unwrap();
        assert_eq!(single_line(&out), "6.6.13-macaroni");
    }
}

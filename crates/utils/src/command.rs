//! Helpers intended for [`std::process::Command`].

use std::process::Command;

use anyhow::{Context, Result};

/// Only the trailing part of a failed child's stderr is kept, to avoid
/// pathological error messages.
const MAX_STDERR_BYTES: usize = 1024;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process with stdio inherited from the parent. On
    /// failure the error includes the full commandline.
    fn run_inherited_with_cmd_context(&mut self) -> Result<()>;

    /// Execute the child process, capturing stderr. On failure the error
    /// includes the commandline and the tail of stderr.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Render the commandline in a form that can be pasted into a shell.
    fn to_string_pretty(&self) -> String;
}

fn stderr_tail(buf: &[u8]) -> String {
    let start = buf.len().saturating_sub(MAX_STDERR_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim_end().to_owned()
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_inherited_with_cmd_context(&mut self) -> Result<()> {
        let status = self
            .status()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        if !status.success() {
            anyhow::bail!("Subprocess failed: {status}: {}", self.to_string_pretty());
        }
        Ok(())
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let output = self
            .stderr(std::process::Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        if !output.status.success() {
            anyhow::bail!(
                "Subprocess failed: {}: {}\n{}",
                output.status,
                self.to_string_pretty(),
                stderr_tail(&output.stderr)
            );
        }
        Ok(())
    }

    fn to_string_pretty(&self) -> String {
        let words: Vec<String> = std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        // Quoting only fails on interior NUL bytes, which can't be passed to exec anyway.
        shlex::try_join(words.iter().map(|s| s.as_str())).unwrap_or_else(|_| words.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_string_pretty() {
        let mut cmd = Command::new("qemu-img");
        cmd.args(["convert", "-O", "qcow2", "/var/tmp/my image.raw", "out"]);
        similar_asserts::assert_eq!(
            cmd.to_string_pretty(),
            "qemu-img convert -O qcow2 '/var/tmp/my image.raw' out"
        );
    }

    #[test]
    fn test_run_inherited() {
        Command::new("true").run_inherited_with_cmd_context().unwrap();

        let e = Command::new("false")
            .arg("--flag")
            .run_inherited_with_cmd_context()
            .unwrap_err();
        assert!(e.to_string().contains("false --flag"), "{e}");
    }

    #[test]
    fn test_run_capture_stderr() {
        let e = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run_capture_stderr()
            .unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("oops"), "{msg}");
        assert!(msg.contains("sh -c"), "{msg}");
    }

    #[test]
    fn test_stderr_tail() {
        let long = "x".repeat(MAX_STDERR_BYTES * 2) + "end\n";
        let tail = stderr_tail(long.as_bytes());
        assert_eq!(tail.len(), MAX_STDERR_BYTES - 1);
        assert!(tail.ends_with("end"));
    }
}

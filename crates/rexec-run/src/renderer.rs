//! Streaming output for multi-host runs
//!
//! Output is printed line by line as it arrives, prefixed with the host it
//! came from, followed by a one-line-per-host summary once everything is done.

use std::io::{self, Write};

use rexec_runtime::{ExecError, OutputLine};

use crate::executor::HostOutcome;

pub struct StreamingRenderer {
    stdout: io::Stdout,
    stderr: io::Stderr,
}

impl StreamingRenderer {
    pub fn new() -> Self {
        Self {
            stdout: io::stdout(),
            stderr: io::stderr(),
        }
    }

    /// Print a line of remote output. Remote stderr goes to local stderr.
    pub fn host_line(&mut self, host: &str, line: &OutputLine) -> io::Result<()> {
        match line {
            OutputLine::Command(text) => {
                writeln!(self.stdout, "{}", format_command(host, text))?;
                self.stdout.flush()
            }
            OutputLine::Stdout(text) => {
                writeln!(self.stdout, "{}", format_line(host, text))?;
                self.stdout.flush()
            }
            OutputLine::Stderr(text) => {
                writeln!(self.stderr, "{}", format_line(host, text))?;
                self.stderr.flush()
            }
        }
    }

    pub fn summary(&mut self, outcomes: &[HostOutcome]) -> io::Result<()> {
        writeln!(self.stdout)?;
        writeln!(self.stdout, "━━━ summary ━━━")?;
        for outcome in outcomes {
            writeln!(self.stdout, "{}", format_outcome(outcome))?;
        }

        let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
        writeln!(
            self.stdout,
            "  {} succeeded, {} failed",
            outcomes.len() - failed,
            failed
        )?;
        self.stdout.flush()
    }
}

impl Default for StreamingRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn format_line(host: &str, text: &str) -> String {
    format!("[{host}] │ {text}")
}

fn format_command(host: &str, command: &str) -> String {
    format!("[{host}] $ \x1b[1;37m{command}\x1b[0m")
}

fn format_outcome(outcome: &HostOutcome) -> String {
    match &outcome.result {
        Ok(result) if result.ok() => {
            format!("  ✓ {} ({:.1}s)", outcome.key, result.elapsed.as_secs_f64())
        }
        Ok(result) => format!(
            "  ! {} exited with {} ({:.1}s)",
            outcome.key,
            result.exit_code,
            result.elapsed.as_secs_f64()
        ),
        Err(ExecError::NonZeroExit(result)) => {
            format!("  ✗ {} exited with {}", outcome.key, result.exit_code)
        }
        Err(e) => format!("  ✗ {}: {e}", outcome.key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rexec_runtime::{InvocationResult, SessionKey};
    use std::time::Duration;

    fn key() -> SessionKey {
        SessionKey {
            host: "web-01".to_string(),
            port: 22,
            user: "deploy".to_string(),
        }
    }

    fn result(exit_code: i32) -> InvocationResult {
        InvocationResult {
            command: "uptime".to_string(),
            exit_code,
            stdout: Default::default(),
            stderr: Default::default(),
            elapsed: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_format_line() {
        assert_eq!(
            format_line("deploy@web-01:22", "hello"),
            "[deploy@web-01:22] │ hello"
        );
    }

    #[test]
    fn test_format_command() {
        assert_eq!(
            format_command("deploy@web-01:22", "uptime"),
            "[deploy@web-01:22] $ \x1b[1;37muptime\x1b[0m"
        );
    }

    #[test]
    fn test_format_outcomes() {
        let ok = HostOutcome {
            key: key(),
            result: Ok(result(0)),
        };
        assert_eq!(format_outcome(&ok), "  ✓ deploy@web-01:22 (1.5s)");

        let warned = HostOutcome {
            key: key(),
            result: Ok(result(3)),
        };
        assert_eq!(
            format_outcome(&warned),
            "  ! deploy@web-01:22 exited with 3 (1.5s)"
        );

        let failed = HostOutcome {
            key: key(),
            result: Err(ExecError::NonZeroExit(Box::new(result(1)))),
        };
        assert_eq!(format_outcome(&failed), "  ✗ deploy@web-01:22 exited with 1");

        let busy = HostOutcome {
            key: key(),
            result: Err(ExecError::SessionBusy(key())),
        };
        assert_eq!(
            format_outcome(&busy),
            "  ✗ deploy@web-01:22: session for deploy@web-01:22 is busy"
        );
    }
}

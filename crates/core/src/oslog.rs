//! OS error log housekeeping around a test run.
//!
//! Runs clear the SUT's error logs before they start so that errors found
//! afterwards can be attributed to the run.

use std::time::Duration;

use chrono::Local;
use tracing::info;

use crate::error::{PlatvalError, TestError};
use crate::exec::SutExecutor;
use crate::types::OsType;

const LINUX_CLEAR_COMMANDS: [&str; 4] = [
    "mkdir -p /var/log/journal",
    "dmesg --clear",
    "journalctl --rotate && journalctl --vacuum-time=1s",
    "echo '' > /var/log/messages",
];

/// Sets the SUT clock to the host's and clears its OS error logs.
pub async fn clear_os_error_logs(
    executor: &dyn SutExecutor,
    timeout: Duration,
) -> Result<(), PlatvalError> {
    let now = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    match executor.os_type() {
        OsType::Linux => {
            executor
                .execute_checked(&format!("date --set=\"{now}\""), timeout)
                .await?;
            for command in LINUX_CLEAR_COMMANDS {
                executor.execute_checked(command, timeout).await?;
            }
        }
        OsType::Windows => {
            executor
                .execute_checked(&format!("powershell Set-Date -Date \"{now}\""), timeout)
                .await?;
            executor
                .execute_checked("wevtutil cl System", timeout)
                .await?;
        }
        OsType::Esxi => {
            return Err(TestError::Unsupported("clearing os logs on esxi".to_owned()).into());
        }
    }
    info!(sut = %executor.description(), "os error logs cleared");
    Ok(())
}

/// Kernel / system log lines mentioning an error or a failure.
pub async fn collect_os_errors(
    executor: &dyn SutExecutor,
    timeout: Duration,
) -> Result<Vec<String>, PlatvalError> {
    let command = match executor.os_type() {
        OsType::Linux | OsType::Esxi => "dmesg | egrep -i 'error|fail'",
        OsType::Windows => {
            "powershell \"Get-WinEvent -FilterHashtable @{LogName='System'; Level=1,2} \
             -ErrorAction SilentlyContinue | Select-Object -ExpandProperty Message\""
        }
    };
    // grep exits 1 when nothing matched
    let out = executor.execute(command, timeout).await?;
    Ok(out.lines().map(str::to_owned).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ScriptedExecutor;
    use crate::types::Verdict;

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn clear_linux_sets_date_then_clears() {
        let exec = ScriptedExecutor::new(OsType::Linux);
        clear_os_error_logs(&exec, T).await.unwrap();
        let history = exec.history();
        assert!(history[0].starts_with("date --set="));
        assert_eq!(history.len(), 1 + LINUX_CLEAR_COMMANDS.len());
        assert_eq!(exec.count_matching("dmesg --clear"), 1);
    }

    #[tokio::test]
    async fn clear_windows_uses_wevtutil() {
        let exec = ScriptedExecutor::new(OsType::Windows);
        clear_os_error_logs(&exec, T).await.unwrap();
        assert_eq!(exec.count_matching("wevtutil cl System"), 1);
    }

    #[tokio::test]
    async fn clear_failure_propagates() {
        let exec =
            ScriptedExecutor::new(OsType::Linux).with_failure("dmesg --clear", 1, "permission");
        let err = clear_os_error_logs(&exec, T).await.unwrap_err();
        assert_eq!(err.verdict(), Verdict::Fail);
    }

    #[tokio::test]
    async fn clear_esxi_unsupported() {
        let exec = ScriptedExecutor::new(OsType::Esxi);
        let err = clear_os_error_logs(&exec, T).await.unwrap_err();
        assert_eq!(err.verdict(), Verdict::Unsupported);
    }

    #[tokio::test]
    async fn collect_returns_matching_lines() {
        let exec = ScriptedExecutor::new(OsType::Linux).with_reply(
            "dmesg | egrep",
            "[  3.1] ACPI Error: AE_NOT_FOUND\n\n[ 10.2] ice: probe failed\n",
        );
        let lines = collect_os_errors(&exec, T).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("probe failed"));
    }

    #[tokio::test]
    async fn collect_tolerates_grep_no_match_exit() {
        let exec = ScriptedExecutor::new(OsType::Linux).with_failure("dmesg | egrep", 1, "");
        assert!(collect_os_errors(&exec, T).await.unwrap().is_empty());
    }
}

//! Process-liveness check. Unix sends signal zero; a permission error still
//! proves the pid exists. Anything that cannot be determined within the
//! timeout counts as "not alive".

use std::time::Duration;

const ALIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(unix)]
pub async fn pid_alive(pid: i64) -> bool {
    if pid <= 0 || pid > i32::MAX as i64 {
        return false;
    }
    // kill(pid, 0) never blocks; the timeout guards the spawn_blocking hop.
    let check = tokio::task::spawn_blocking(move || {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            true
        } else {
            std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }
    });
    matches!(
        tokio::time::timeout(ALIVE_TIMEOUT, check).await,
        Ok(Ok(true))
    )
}

#[cfg(not(unix))]
pub async fn pid_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    let run = tokio::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
        .output();
    match tokio::time::timeout(ALIVE_TIMEOUT, run).await {
        Ok(Ok(output)) => String::from_utf8_lossy(&output.stdout).contains(&format!("\"{pid}\"")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_pid_exists_on_unix() {
        #[cfg(unix)]
        assert!(pid_alive(1).await); // pid 1 always exists; EPERM still counts
    }

    #[tokio::test]
    async fn non_positive_pids_are_dead() {
        assert!(!pid_alive(0).await);
        assert!(!pid_alive(-5).await);
    }
}

//! System TCP-listener enumeration via the platform tool (`lsof` on Unix,
//! `netstat` on Windows), bounded by a hard timeout and an output cap.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use crate::{ProbeError, SystemListener};

/// Spawn the enumeration tool and parse its output into a sorted,
/// per-port-deduplicated listener list.
pub async fn enumerate(
    timeout: Duration,
    output_cap: usize,
) -> Result<Vec<SystemListener>, ProbeError> {
    let output = run_tool(timeout).await?;
    let text = &output[..output.len().min(output_cap)];
    let text = String::from_utf8_lossy(text);
    let listeners = if cfg!(unix) {
        parse_lsof_output(&text)
    } else {
        parse_netstat_output(&text)
    };
    debug!(count = listeners.len(), "system listeners enumerated");
    Ok(listeners)
}

#[cfg(unix)]
async fn run_tool(timeout: Duration) -> Result<Vec<u8>, ProbeError> {
    let run = tokio::process::Command::new("lsof")
        .args(["-nP", "-iTCP", "-sTCP:LISTEN"])
        .output();
    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(output)) => Ok(output.stdout),
        Ok(Err(e)) => Err(ProbeError::Enumerate(e.to_string())),
        Err(_) => Err(ProbeError::Enumerate("lsof timed out".into())),
    }
}

#[cfg(not(unix))]
async fn run_tool(timeout: Duration) -> Result<Vec<u8>, ProbeError> {
    let run = tokio::process::Command::new("netstat").args(["-ano"]).output();
    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(output)) => Ok(output.stdout),
        Ok(Err(e)) => Err(ProbeError::Enumerate(e.to_string())),
        Err(_) => Err(ProbeError::Enumerate("netstat timed out".into())),
    }
}

/// Parse `lsof -nP -iTCP -sTCP:LISTEN` output.
///
/// Columns: COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME, with NAME
/// like `127.0.0.1:3100 (LISTEN)` or `*:8080 (LISTEN)`.
pub fn parse_lsof_output(text: &str) -> Vec<SystemListener> {
    let mut by_port: BTreeMap<u16, SystemListener> = BTreeMap::new();
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let Some(port) = extract_port(fields[8]) else {
            continue;
        };
        by_port.entry(port).or_insert(SystemListener {
            port,
            pid: fields[1].parse().ok(),
            command: Some(fields[0].to_string()),
            user: Some(fields[2].to_string()),
        });
    }
    by_port.into_values().collect()
}

/// Parse `netstat -ano` output, keeping LISTENING TCP rows.
fn parse_netstat_output(text: &str) -> Vec<SystemListener> {
    let mut by_port: BTreeMap<u16, SystemListener> = BTreeMap::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || fields[0] != "TCP" || fields[3] != "LISTENING" {
            continue;
        }
        let Some(port) = extract_port(fields[1]) else {
            continue;
        };
        by_port.entry(port).or_insert(SystemListener {
            port,
            pid: fields[4].parse().ok(),
            command: None,
            user: None,
        });
    }
    by_port.into_values().collect()
}

/// Pull the port out of an `addr:port` token, tolerating IPv6 brackets.
fn extract_port(name: &str) -> Option<u16> {
    let addr = name.split_whitespace().next()?;
    addr.rsplit(':').next()?.parse().ok()
}

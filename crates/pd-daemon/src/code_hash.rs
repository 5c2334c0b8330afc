//! Boot-time identity hash exposed at `/version`. Clients compare it
//! against their own build to detect a stale daemon. The running
//! executable image stands in for the source set of script runtimes.

use std::io::Read;

use ring::digest;

/// Short hex digest of the running executable, computed once at boot.
/// Falls back to the crate version when the binary cannot be read.
pub fn compute() -> String {
    executable_digest().unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION")))
}

fn executable_digest() -> Option<String> {
    let path = std::env::current_exe().ok()?;
    let mut file = std::fs::File::open(path).ok()?;
    let mut context = digest::Context::new(&digest::SHA256);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        context.update(&buf[..n]);
    }
    let digest = context.finish();
    let hex: String = digest
        .as_ref()
        .iter()
        .take(6)
        .map(|b| format!("{b:02x}"))
        .collect();
    Some(hex)
}

//! Daemon lifecycle: configuration and listeners, the periodic reaper, the
//! single-instance lockfile, and the boot-time code hash.

pub mod code_hash;
pub mod daemon;
pub mod lockfile;
pub mod reaper;

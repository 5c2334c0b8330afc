//! The coordination registry: atomic port claims for semantic identities,
//! per-environment endpoint URLs, and named advisory locks.

pub mod locks;
pub mod services;

pub use locks::{LockError, LockManager};
pub use services::{
    ClaimOutcome, ClaimRequest, ReleaseOutcome, ReleaseRequest, RegistryError, ServiceFilter,
    ServicesRegistry,
};

//! OpenDAL Operator factory for the vault storage root

use capsule_core::config::{VaultBackend, VaultConfig};
use capsule_core::{CapsuleError, CapsuleResult};
use opendal::Operator;

/// Build the operator for the configured backend.
///
/// `cfg.root` is used as given; callers expand `~` beforehand.
pub fn build_operator(cfg: &VaultConfig) -> CapsuleResult<Operator> {
    match cfg.backend {
        VaultBackend::Fs => fs_operator(&cfg.root.to_string_lossy()),
        VaultBackend::Memory => memory_operator(),
    }
}

/// Filesystem-backed vault rooted at `root` (created on first write).
pub fn fs_operator(root: &str) -> CapsuleResult<Operator> {
    let builder = opendal::services::Fs::default().root(root);
    let op = Operator::new(builder)
        .map_err(|e| CapsuleError::Storage(format!("creating fs operator at {root}: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();
    Ok(op)
}

/// Process-local vault, gone when the operator is dropped.
pub fn memory_operator() -> CapsuleResult<Operator> {
    let op = Operator::new(opendal::services::Memory::default())
        .map_err(|e| CapsuleError::Storage(format!("creating memory operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();
    Ok(op)
}

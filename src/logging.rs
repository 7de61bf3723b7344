//! Installs a `tracing` subscriber for binaries, benches and tests.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, StoreError};

/// Installs a global fmt subscriber filtered by `filter` (e.g. `"blocktree=debug"`).
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| StoreError::Config(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| StoreError::Invalid("logging already initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_filter() {
        assert!(matches!(
            init_logging("blocktree=notalevel"),
            Err(StoreError::Config(_))
        ));
    }
}

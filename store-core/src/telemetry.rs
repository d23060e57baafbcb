//! Tracing bootstrap

use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// Defaults to INFO, overridable via `RUST_LOG`. Safe to call more than
/// once (later calls are no-ops), so tests and embedding binaries can both
/// use it.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_reentrant() {
        init();
        init();
    }
}

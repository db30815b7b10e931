//! Console logging for CLI commands

/// Initialize logging (RUST_LOG overrides the default warn level).
pub fn init() {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
    .with_target(false)
    .init();
}

//! Embedded sample files written by `init`.

/// Default `agent-sandbox.toml` configuration.
pub(crate) const AGENT_SANDBOX_TOML: &str = include_str!("agent-sandbox.toml");

/// Sample `manifest.toml` with one template, one pool and one claim.
pub(crate) const MANIFEST_TOML: &str = include_str!("manifest.toml");

// rusty-vswitch: Library entry point.
// Re-exports the wire and engine crates; integration suites live under
// tests/integration.

pub use vs_api as api;
pub use vs_om as om;

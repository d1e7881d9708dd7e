//! Canbus Node -- library crate for the node daemon and operator tools.
//!
//! Re-exports the modules so integration tests and main.rs share the node
//! wiring, the UDP bus and the name tables.

pub mod config;
pub mod node;
pub mod resolver;
pub mod tools;
pub mod udp_bus;

use std::path::PathBuf;

/// Expand ~ to home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/etc/canbus/hosts"), PathBuf::from("/etc/canbus/hosts"));
        assert_eq!(expand_tilde("relative/db"), PathBuf::from("relative/db"));
    }

    #[test]
    fn test_expand_tilde_uses_home() {
        if let Some(home) = dirs_or_home() {
            assert_eq!(expand_tilde("~/.canbus/hosts"), home.join(".canbus/hosts"));
        }
    }
}

// Backend trait definitions and core types

pub mod filter;
pub mod monitor;
pub mod process;

/// Backend priority ranking (higher = better)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackendPriority {
    Fallback = 1, // Works but limited (no-op or polling backends)
    Good = 2,     // Solid implementation
    Better = 3,   // Modern, efficient
    Best = 4,     // Optimal native API
}

/// Backend metadata for `--list-backends`
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub name: &'static str,
    pub priority: BackendPriority,
    pub available: bool,
}

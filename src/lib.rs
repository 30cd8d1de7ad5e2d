pub mod batch;
pub mod config;
pub mod consistency;
pub mod db;
pub mod ingest;

/// Prefix every stored tag carries
pub const TAG_SIGIL: char = '#';

/// Application name for XDG paths
pub const APP_NAME: &str = "moodring";

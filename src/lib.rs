pub mod audio;
pub mod cache;
pub mod config;
pub mod pool;
pub mod scanner;
pub mod spectral;

/// Audio file extensions we accept as stems
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "wav", "flac", "mp3", "ogg", "aif", "aiff", "m4a", "aac",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "stemprep";

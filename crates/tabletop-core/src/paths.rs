//! Platform-specific application directories.
//!
//! - Windows:  `%APPDATA%\Tabletop`
//! - Linux:    `$XDG_CONFIG_HOME/tabletop` or `~/.config/tabletop`
//! - macOS:    `~/Library/Application Support/Tabletop`
//!
//! The server keeps its `server.toml` here, and both ends keep their key
//! pair files here.

use std::path::PathBuf;

/// Resolves the application config directory, or `None` when the platform
/// base directory cannot be determined from the environment.
pub fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Tabletop"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("tabletop"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Tabletop")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

/// Where downloaded assets are cached, below the config directory.
pub fn asset_cache_dir() -> Option<PathBuf> {
    platform_config_dir().map(|d| d.join("assets"))
}

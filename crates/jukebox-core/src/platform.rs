//! Where the daemon keeps its files, and how it finds its helper binaries.

use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9877;

const APP_DIR: &str = "jukebox";

/// Holds `daemon.log`.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

/// Holds `config.toml`.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Default audio cache directory.
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

#[cfg(unix)]
pub fn mpv_socket_name() -> String {
    std::env::temp_dir()
        .join("jukebox-mpv.sock")
        .display()
        .to_string()
}

#[cfg(windows)]
pub fn mpv_socket_name() -> String {
    "jukebox-mpv".to_string()
}

pub fn mpv_socket_arg() -> String {
    if cfg!(windows) {
        format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name())
    } else {
        format!("--input-ipc-server={}", mpv_socket_name())
    }
}

/// Find mpv for playback (`MPV_PATH` overrides).
pub fn find_mpv_binary() -> Option<PathBuf> {
    find_binary("MPV_PATH", "mpv", &[])
}

/// Find yt-dlp for downloads and lookups (`YT_DLP_PATH` overrides).
pub fn find_yt_dlp_binary() -> Option<PathBuf> {
    find_binary("YT_DLP_PATH", "yt-dlp", &["yt-dlp_linux", "yt-dlp_macos"])
}

/// `env_var` first, then next to our own executable, then `PATH`.
fn find_binary(env_var: &str, name: &str, aliases: &[&str]) -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(env_var).map(PathBuf::from) {
        if path.is_file() {
            return Some(path);
        }
    }

    let candidates = executable_names(name, aliases);
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from));
    let search_path = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
        .unwrap_or_default();

    beside_exe
        .into_iter()
        .chain(search_path)
        .flat_map(|dir| candidates.iter().map(move |c| dir.join(c)))
        .find(|p| p.is_file())
}

fn executable_names(name: &str, aliases: &[&str]) -> Vec<String> {
    let mut names: Vec<String> = std::iter::once(name)
        .chain(aliases.iter().copied())
        .map(str::to_string)
        .collect();
    if cfg!(windows) {
        names.insert(0, format!("{}.exe", name));
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_are_namespaced() {
        assert!(config_dir().ends_with("jukebox"));
        assert!(data_dir().ends_with("jukebox"));
        assert!(cache_dir().ends_with("jukebox"));
    }

    #[test]
    fn test_primary_name_comes_first() {
        let names = executable_names("yt-dlp", &["yt-dlp_linux"]);
        assert!(names.contains(&"yt-dlp".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("yt-dlp_linux"));
    }

    #[test]
    fn test_env_override_must_exist() {
        assert!(find_binary("JUKEBOX_TEST_NO_SUCH_VAR", "definitely-not-a-binary-xyz", &[]).is_none());
    }
}

//! Where habitlinkd keeps its socket, database and config unless told
//! otherwise.
//!
//! Everything resolves under the user's XDG directories so the service runs
//! unprivileged. `HABITLINK_SOCKET` and `HABITLINK_DATA_DIR` replace the
//! socket path and the data directory outright.

use std::path::PathBuf;

pub const HABITLINK_SOCKET_ENV: &str = "HABITLINK_SOCKET";
pub const HABITLINK_DATA_DIR_ENV: &str = "HABITLINK_DATA_DIR";

/// SQLite file inside the data directory
pub const DATABASE_FILENAME: &str = "habitlink.db";

const APP_DIR: &str = "habitlink";

/// `$HABITLINK_SOCKET`, else `habitlink/habitlinkd.sock` under the runtime
/// dir, else a per-user directory in `/tmp`
pub fn default_socket_path() -> PathBuf {
    socket_path_from(env_var)
}

/// `$HABITLINK_DATA_DIR`, else `habitlink` under the XDG data home
pub fn default_data_dir() -> PathBuf {
    data_dir_from(env_var)
}

/// `habitlink/config.toml` under the XDG config home, else under `/etc`
pub fn default_config_path() -> PathBuf {
    config_path_from(env_var)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// `$base_var/habitlink`, falling back to `$HOME/home_rel/habitlink`
fn xdg_app_dir(
    lookup: &impl Fn(&str) -> Option<String>,
    base_var: &str,
    home_rel: &str,
) -> Option<PathBuf> {
    lookup(base_var)
        .map(PathBuf::from)
        .or_else(|| lookup("HOME").map(|home| PathBuf::from(home).join(home_rel)))
        .map(|base| base.join(APP_DIR))
}

fn socket_path_from(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(path) = lookup(HABITLINK_SOCKET_ENV) {
        return PathBuf::from(path);
    }

    let dir = match lookup("XDG_RUNTIME_DIR") {
        Some(runtime) => PathBuf::from(runtime).join(APP_DIR),
        None => {
            let user = lookup("USER").unwrap_or_else(|| "unknown".into());
            PathBuf::from(format!("/tmp/{APP_DIR}-{user}"))
        }
    };
    dir.join("habitlinkd.sock")
}

fn data_dir_from(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup(HABITLINK_DATA_DIR_ENV)
        .map(PathBuf::from)
        .or_else(|| xdg_app_dir(&lookup, "XDG_DATA_HOME", ".local/share"))
        .unwrap_or_else(|| PathBuf::from("/tmp").join(APP_DIR).join("data"))
}

fn config_path_from(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    xdg_app_dir(&lookup, "XDG_CONFIG_HOME", ".config")
        .unwrap_or_else(|| PathBuf::from("/etc").join(APP_DIR))
        .join("config.toml")
}

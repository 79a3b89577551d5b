//! Socket, PID, and token file path resolution.
//!
//! Priority for the runtime directory:
//! 1. `PTYKEEP_SOCKET_DIR` (explicit override)
//! 2. `XDG_RUNTIME_DIR/ptykeep` (Linux standard)
//! 3. `~/.ptykeep` (home directory fallback)
//! 4. System temp dir (last resort)
//!
//! The daemon writes three files there: `daemon.sock`, `daemon.pid`, and
//! `daemon.token` (the shared secret a client must present in its hello
//! frame). The directory is created 0700 and the token file 0600.

use std::env;
use std::path::{Path, PathBuf};

// Env var manipulation is process-global; every test touching the
// runtime-dir variables serializes on this lock.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Get the runtime directory with priority fallback.
pub fn get_runtime_dir() -> PathBuf {
    // 1. Explicit override (ignore empty)
    if let Ok(dir) = env::var("PTYKEEP_SOCKET_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    // 2. XDG_RUNTIME_DIR (Linux standard, ignore empty)
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("ptykeep");
        }
    }

    // 3. Home directory fallback
    if let Some(home) = dirs::home_dir() {
        return home.join(".ptykeep");
    }

    // 4. Last resort: temp dir
    env::temp_dir().join("ptykeep")
}

pub fn get_socket_path() -> PathBuf {
    get_runtime_dir().join("daemon.sock")
}

pub fn get_pid_path() -> PathBuf {
    get_runtime_dir().join("daemon.pid")
}

pub fn get_token_path() -> PathBuf {
    get_runtime_dir().join("daemon.token")
}

/// Ensure the runtime directory exists with secure permissions (0700 on Unix).
pub fn ensure_runtime_dir() -> std::io::Result<()> {
    let dir = get_runtime_dir();
    std::fs::create_dir_all(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

/// Write the authentication token with owner-only permissions.
pub fn write_token(path: &Path, token: &str) -> std::io::Result<()> {
    std::fs::write(path, token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Read the daemon's authentication token, if present.
pub fn read_token(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap();
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), std::env::var(name).ok()))
                .collect();
            Self { vars, _lock: lock }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => std::env::set_var(name, v),
                    None => std::env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn explicit_override_wins() {
        let _guard = EnvGuard::new(&["PTYKEEP_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        std::env::set_var("PTYKEEP_SOCKET_DIR", "/custom/run/path");
        std::env::remove_var("XDG_RUNTIME_DIR");

        assert_eq!(get_runtime_dir(), PathBuf::from("/custom/run/path"));
        assert_eq!(
            get_socket_path(),
            PathBuf::from("/custom/run/path/daemon.sock")
        );
    }

    #[test]
    fn empty_override_is_ignored() {
        let _guard = EnvGuard::new(&["PTYKEEP_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        std::env::set_var("PTYKEEP_SOCKET_DIR", "");
        std::env::remove_var("XDG_RUNTIME_DIR");

        assert!(get_runtime_dir().to_string_lossy().ends_with(".ptykeep"));
    }

    #[test]
    fn xdg_runtime_dir_is_used() {
        let _guard = EnvGuard::new(&["PTYKEEP_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        std::env::remove_var("PTYKEEP_SOCKET_DIR");
        std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");

        assert_eq!(get_runtime_dir(), PathBuf::from("/run/user/1000/ptykeep"));
    }

    #[test]
    fn token_round_trip() {
        let dir = std::env::temp_dir().join(format!("ptykeep-token-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("daemon.token");

        write_token(&path, "secret-token\n").unwrap();
        assert_eq!(read_token(&path), Some("secret-token".to_string()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_or_empty_token_reads_none() {
        let dir = std::env::temp_dir().join(format!("ptykeep-notoken-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(read_token(&dir.join("absent.token")), None);

        let empty = dir.join("empty.token");
        std::fs::write(&empty, "  \n").unwrap();
        assert_eq!(read_token(&empty), None);

        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Authentication cookie file.
//!
//! The cookie is exactly 256 bytes of random data stored at
//! `$XDG_CONFIG_HOME/sabine/cookie` (fallback `$HOME/.sabine-cookie`),
//! created with mode 0600 on first use. It is opaque: authentication
//! is a constant-time byte comparison on both ends.

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::info;

use crate::error::WireError;
use crate::COOKIE_SIZE;

/// Default on-disk location, honouring `XDG_CONFIG_HOME`.
pub fn default_path() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Path::new(&xdg).join("sabine").join("cookie");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return Path::new(&home).join(".sabine-cookie");
    }
    PathBuf::from(".sabine-cookie")
}

/// Loads the cookie, creating it with fresh random bytes if absent.
pub fn load_or_create(path: &Path) -> Result<[u8; COOKIE_SIZE], WireError> {
    match fs::read(path) {
        Ok(data) => {
            if data.len() != COOKIE_SIZE {
                return Err(WireError::BadCookie(format!(
                    "{} is {} bytes, expected {}",
                    path.display(),
                    data.len(),
                    COOKIE_SIZE
                )));
            }
            let mut cookie = [0u8; COOKIE_SIZE];
            cookie.copy_from_slice(&data);
            Ok(cookie)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut cookie = [0u8; COOKIE_SIZE];
            rand::rng().fill_bytes(&mut cookie);
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut f = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)?;
            f.write_all(&cookie)?;
            info!("created new auth cookie at {}", path.display());
            Ok(cookie)
        }
        Err(e) => Err(e.into()),
    }
}

/// Loads an existing cookie; missing or malformed files are an
/// `AuthKey`-class failure.
pub fn load(path: &Path) -> Result<[u8; COOKIE_SIZE], WireError> {
    let data =
        fs::read(path).map_err(|e| WireError::BadCookie(format!("{}: {e}", path.display())))?;
    if data.len() != COOKIE_SIZE {
        return Err(WireError::BadCookie(format!(
            "{} is {} bytes, expected {}",
            path.display(),
            data.len(),
            COOKIE_SIZE
        )));
    }
    let mut cookie = [0u8; COOKIE_SIZE];
    cookie.copy_from_slice(&data);
    Ok(cookie)
}

/// Constant-time comparison of two cookies.
pub fn matches(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_load_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookie");
        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(load(&path).unwrap(), first);

        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn wrong_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookie");
        fs::write(&path, b"short").unwrap();
        assert!(matches!(load(&path), Err(WireError::BadCookie(_))));
        assert!(matches!(load_or_create(&path), Err(WireError::BadCookie(_))));
    }

    #[test]
    fn comparison_is_exact() {
        let a = [1u8; COOKIE_SIZE];
        let mut b = a;
        assert!(matches(&a, &b));
        b[255] ^= 1;
        assert!(!matches(&a, &b));
        assert!(!matches(&a[..10], &a));
    }
}

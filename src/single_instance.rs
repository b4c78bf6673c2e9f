use fs2::FileExt as _;
use std::{fs::OpenOptions, path::Path};

#[derive(Debug)]
pub enum InstanceLockError {
    Open {
        path: String,
        source: std::io::Error,
    },
    AlreadyRunning {
        path: String,
    },
    Lock {
        path: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for InstanceLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { path, .. } => write!(f, "failed to open lock file {path}"),
            Self::AlreadyRunning { path } => write!(
                f,
                "another rust-vault instance appears to be running (lock held at {path})"
            ),
            Self::Lock { path, .. } => write!(f, "failed to lock {path}"),
        }
    }
}

impl std::error::Error for InstanceLockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } => Some(source),
            Self::Lock { source, .. } => Some(source),
            Self::AlreadyRunning { .. } => None,
        }
    }
}

/// Advisory lock on `<data_dir>/rust-vault.lock`. The OS drops the lock if
/// the process dies, so a stale file never blocks a restart.
#[derive(Debug)]
pub struct InstanceLock {
    _file: std::fs::File,
}

impl InstanceLock {
    pub fn acquire(data_dir: impl AsRef<Path>) -> Result<Self, InstanceLockError> {
        let path = data_dir.as_ref().join("rust-vault.lock");
        let display = path.display().to_string();

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| InstanceLockError::Open {
                path: display.clone(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(InstanceLockError::AlreadyRunning { path: display })
            }
            Err(source) => Err(InstanceLockError::Lock {
                path: display,
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_dir_fails_until_first_is_dropped() {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        dir.push(format!("rust-vault-lock-{nanos}"));
        std::fs::create_dir_all(&dir).expect("mkdir");

        let first = InstanceLock::acquire(&dir).expect("first lock");
        let second = InstanceLock::acquire(&dir);
        assert!(matches!(
            second,
            Err(InstanceLockError::AlreadyRunning { .. })
        ));

        drop(first);
        let third = InstanceLock::acquire(&dir).expect("lock after release");
        drop(third);
        let _ = std::fs::remove_dir_all(dir);
    }
}

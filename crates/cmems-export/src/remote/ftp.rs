//! FTP remote store
//!
//! `suppaftp`'s blocking client runs on the blocking thread pool. One login
//! session is held for the whole run and shared behind a mutex, so remote
//! operations execute strictly one at a time.
//!
//! ```rust,ignore
//! use cmems_export::config::FtpConfig;
//! use cmems_export::remote::{FtpRemoteStore, RemoteStore};
//!
//! let store = FtpRemoteStore::connect(&FtpConfig::default()).await?;
//! let listing = store.list("/INSITU_GLO_CARBON_NRT_OBSERVATIONS_013_049/DNT").await?;
//! store.disconnect().await?;
//! ```

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode, Status};
use tracing::{debug, info, warn};

use super::{RemoteEntry, RemoteError, RemoteResult, RemoteStore};
use crate::config::FtpConfig;

pub struct FtpRemoteStore {
    session: Arc<Mutex<FtpStream>>,
}

impl FtpRemoteStore {
    /// Open and authenticate a session (extended passive mode, binary transfers)
    pub async fn connect(config: &FtpConfig) -> RemoteResult<Self> {
        let config = config.clone();
        let host = config.host.clone();

        let stream = tokio::task::spawn_blocking(move || {
            debug!("Connecting to FTP server: {}:{}", config.host, config.port);
            let mut stream = FtpStream::connect(format!("{}:{}", config.host, config.port))
                .map_err(|e| RemoteError::Connection(e.to_string()))?;

            // Extended Passive Mode copes with NAT between us and the push server
            stream.set_mode(Mode::ExtendedPassive);

            debug!("Logging in as: {}", config.username);
            stream
                .login(&config.username, &config.password)
                .map_err(|e| RemoteError::Connection(format!("login failed: {}", e)))?;

            stream
                .transfer_type(FileType::Binary)
                .map_err(|e| RemoteError::Connection(format!("cannot set binary mode: {}", e)))?;

            Ok::<_, RemoteError>(stream)
        })
        .await
        .map_err(|e| RemoteError::Session(format!("FTP connect task panicked: {}", e)))??;

        info!(%host, "Connected to push server");
        Ok(Self {
            session: Arc::new(Mutex::new(stream)),
        })
    }

    /// End the session gracefully
    pub async fn disconnect(&self) -> RemoteResult<()> {
        self.with_session(|stream| {
            if let Err(e) = stream.quit() {
                warn!("Failed to quit FTP session gracefully: {}", e);
            }
            Ok(())
        })
        .await
    }

    async fn with_session<T, F>(&self, op: F) -> RemoteResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> RemoteResult<T> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let mut stream = session
                .lock()
                .map_err(|_| RemoteError::Session("FTP session lock poisoned".to_string()))?;
            op(&mut *stream)
        })
        .await
        .map_err(|e| RemoteError::Session(format!("FTP task panicked: {}", e)))?
    }
}

#[async_trait]
impl RemoteStore for FtpRemoteStore {
    async fn is_dir(&self, path: &str) -> RemoteResult<bool> {
        let path = path.to_string();
        self.with_session(move |stream| {
            let original = stream
                .pwd()
                .map_err(|e| RemoteError::transport(&path, e))?;
            match stream.cwd(&path) {
                Ok(()) => {
                    stream
                        .cwd(&original)
                        .map_err(|e| RemoteError::transport(&original, e))?;
                    Ok(true)
                },
                Err(e) if is_file_unavailable(&e) => Ok(false),
                Err(e) => Err(RemoteError::transport(&path, e)),
            }
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> RemoteResult<()> {
        let path = path.to_string();
        self.with_session(move |stream| {
            stream.mkdir(&path).map_err(|e| RemoteError::transport(&path, e))?;
            debug!(%path, "Created remote directory");
            Ok(())
        })
        .await
    }

    async fn exists(&self, path: &str) -> RemoteResult<bool> {
        let path = path.to_string();
        self.with_session(move |stream| match stream.size(&path) {
            Ok(_) => Ok(true),
            Err(e) if is_file_unavailable(&e) => Ok(false),
            Err(e) => Err(RemoteError::transport(&path, e)),
        })
        .await
    }

    async fn put(&self, local: &Path, remote: &str) -> RemoteResult<u64> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.with_session(move |stream| {
            let mut file = std::fs::File::open(&local)?;
            let bytes = stream
                .put_file(&remote, &mut file)
                .map_err(|e| RemoteError::transport(&remote, e))?;
            debug!(remote_path = %remote, bytes, "Uploaded file");
            Ok(bytes)
        })
        .await
    }

    async fn get(&self, remote: &str) -> RemoteResult<Vec<u8>> {
        let remote = remote.to_string();
        self.with_session(move |stream| match stream.retr_as_buffer(&remote) {
            Ok(cursor) => Ok(cursor.into_inner()),
            Err(e) if is_file_unavailable(&e) => Err(RemoteError::NotFound(remote)),
            Err(e) => Err(RemoteError::transport(&remote, e)),
        })
        .await
    }

    async fn remove(&self, remote: &str) -> RemoteResult<()> {
        let remote = remote.to_string();
        self.with_session(move |stream| {
            stream.rm(&remote).map_err(|e| RemoteError::transport(&remote, e))
        })
        .await
    }

    async fn rmdir(&self, path: &str) -> RemoteResult<()> {
        let path = path.to_string();
        self.with_session(move |stream| {
            stream.rmdir(&path).map_err(|e| RemoteError::transport(&path, e))
        })
        .await
    }

    async fn list(&self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let path = path.to_string();
        self.with_session(move |stream| {
            let lines = stream
                .list(Some(&path))
                .map_err(|e| RemoteError::transport(&path, e))?;
            Ok(lines.iter().filter_map(|line| parse_list_line(line)).collect())
        })
        .await
    }
}

/// 550 is the only reply that means "no such file"; anything else
/// (421, 502, 530, ...) leaves the path unverified.
fn is_file_unavailable(err: &FtpError) -> bool {
    matches!(err, FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable)
}

/// Parse one Unix-style `LIST` line:
///
/// `drwxr-xr-x   2 ftp ftp  4096 Jan 15 12:00 20240101`
/// `-rw-r--r--   1 ftp ftp  1234 Jan 15 12:00 A_20240101.nc`
pub fn parse_list_line(line: &str) -> Option<RemoteEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }

    let name = if parts.len() >= 9 {
        parts[8..].join(" ")
    } else {
        parts.last()?.to_string()
    };
    if name == "." || name == ".." {
        return None;
    }

    let size = if parts.len() >= 5 {
        parts[4].parse().ok()
    } else {
        None
    };

    Some(RemoteEntry {
        name,
        is_directory: parts[0].starts_with('d'),
        size,
    })
}

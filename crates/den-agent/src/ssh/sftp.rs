//! SFTP subsystem
//!
//! Serves file transfer over a session channel, rooted at the user's home
//! directory so connections land where scp/sftp clients expect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle as SftpFileHandle, Name, OpenFlags, Status,
    StatusCode, Version,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use den_core::util::user_home_dir;

/// Serve SFTP on `channel` and report the final exit status.
pub(crate) async fn serve(channel: Channel<Msg>, handle: Handle, channel_id: ChannelId) {
    let Some(home) = user_home_dir() else {
        tracing::warn!("get sftp working directory failed, unable to get home dir");
        let _ = handle.exit_status_request(channel_id, 1).await;
        let _ = handle.close(channel_id).await;
        return;
    };

    let _ = russh_sftp::server::run(channel.into_stream(), SftpSession::new(home)).await;

    // The server returning means the client hung up. Without an explicit
    // exit-status the channel closes bare, which clients like macOS scp
    // report as failure.
    let _ = handle.exit_status_request(channel_id, 0).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
}

enum OpenHandle {
    File(tokio::fs::File),
    /// Directory listing, delivered in one batch then EOF.
    Dir(Option<Vec<File>>),
}

struct SftpSession {
    cwd: PathBuf,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpSession {
    fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    fn insert_handle(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let key = self.next_handle.to_string();
        self.handles.insert(key.clone(), handle);
        key
    }

    fn status_ok(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }
}

fn io_status(err: &std::io::Error) -> StatusCode {
    match err.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        _version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<SftpFileHandle, Self::Error> {
        let path = self.resolve(&filename);
        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .append(pflags.contains(OpenFlags::APPEND))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE));

        let file = options.open(&path).await.map_err(|e| io_status(&e))?;
        Ok(SftpFileHandle {
            id,
            handle: self.insert_handle(OpenHandle::File(file)),
        })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.handles.remove(&handle);
        Ok(Self::status_ok(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let Some(OpenHandle::File(file)) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;

        let mut data = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file
                .read(&mut data[filled..])
                .await
                .map_err(|e| io_status(&e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(filled);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let Some(OpenHandle::File(file)) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;
        file.write_all(&data).await.map_err(|e| io_status(&e))?;
        Ok(Self::status_ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<SftpFileHandle, Self::Error> {
        let path = self.resolve(&path);
        let mut dir = tokio::fs::read_dir(&path).await.map_err(|e| io_status(&e))?;

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let attrs = match entry.metadata().await {
                Ok(metadata) => FileAttributes::from(&metadata),
                Err(_) => FileAttributes::default(),
            };
            entries.push(File::new(name, attrs));
        }
        Ok(SftpFileHandle {
            id,
            handle: self.insert_handle(OpenHandle::Dir(Some(entries))),
        })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let Some(OpenHandle::Dir(entries)) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        match entries.take() {
            Some(files) => Ok(Name { id, files }),
            None => Err(StatusCode::Eof),
        }
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = self.resolve(&path);
        // Canonicalize when possible so ".." and symlinks collapse.
        let resolved = tokio::fs::canonicalize(&resolved)
            .await
            .unwrap_or(resolved);
        Ok(Name {
            id,
            files: vec![File::dummy(resolved.to_string_lossy())],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::metadata(self.resolve(&path))
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::symlink_metadata(self.resolve(&path))
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_file(self.resolve(&filename))
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Self::status_ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        tokio::fs::create_dir(self.resolve(&path))
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Self::status_ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_dir(self.resolve(&path))
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Self::status_ok(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        tokio::fs::rename(self.resolve(&oldpath), self.resolve(&newpath))
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Self::status_ok(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_lands_in_cwd() {
        let session = SftpSession::new(PathBuf::from("/home/dev"));
        assert_eq!(session.resolve("notes.txt"), PathBuf::from("/home/dev/notes.txt"));
    }

    #[test]
    fn test_resolve_absolute_passthrough() {
        let session = SftpSession::new(PathBuf::from("/home/dev"));
        assert_eq!(session.resolve("/etc/hosts"), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn test_io_status_mapping() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "x");
        assert_eq!(io_status(&not_found), StatusCode::NoSuchFile);
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "x");
        assert_eq!(io_status(&denied), StatusCode::PermissionDenied);
        let other = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "x");
        assert_eq!(io_status(&other), StatusCode::Failure);
    }
}

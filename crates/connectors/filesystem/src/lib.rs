use cellar_client::{
    CredentialSource, FileStat, Request, Response, SessionToken, StorageBackend,
};
use cellar_common::{Error, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

const STAGING_SUFFIX: &str = ".tmp";

/// In-flight `write` output, not yet renamed into place.
fn is_staging(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(STAGING_SUFFIX)
}

/// A store whose file-shaped entries live under a local root directory.
///
/// Logical paths are resolved relative to the root (a leading `/` is
/// ignored). Row operations are not supported and answer with a remote error.
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, logical: &str) -> Result<PathBuf> {
        let relative = Path::new(logical.trim_start_matches('/'));
        if relative.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Error::Remote(format!("path '{}' escapes the store root", logical)));
        }
        Ok(self.root.join(relative))
    }

    async fn list(&self, directory: &str) -> Result<Vec<FileStat>> {
        let dir = self.resolve(directory)?;
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| map_io(e, directory))?;
        let prefix = directory.trim_end_matches('/');

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !metadata.is_file() || is_staging(&name) {
                continue;
            }
            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or_default();
            files.push(FileStat {
                path: format!("{}/{}", prefix, name),
                size: metadata.len(),
                modified,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn write(&self, logical: &str, content: Vec<u8>) -> Result<u64> {
        let path = self.resolve(logical)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size = content.len() as u64;
        // Same-directory temp file then rename, so readers never see a partial file.
        let staging = path.with_file_name(format!(
            ".{}.{}{}",
            path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            uuid::Uuid::new_v4(),
            STAGING_SUFFIX
        ));
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, &path).await?;
        debug!("Wrote {} bytes to {}", size, path.display());
        Ok(size)
    }
}

fn map_io(err: std::io::Error, logical: &str) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::NotFound(logical.to_string())
    } else {
        Error::Io(err)
    }
}

#[async_trait::async_trait]
impl StorageBackend for LocalFsBackend {
    async fn authenticate(&self, source: &CredentialSource) -> Result<SessionToken> {
        debug!("Local store at {} accepts {:?}", self.root.display(), source);
        if !self.root.is_dir() {
            return Err(Error::Network(format!("store root {} is not a directory", self.root.display())));
        }
        Ok(SessionToken { value: "local".to_string(), expires_at: None })
    }

    async fn execute(&self, _session: &SessionToken, request: Request) -> Result<Response> {
        match request {
            Request::ListFiles { directory } => Ok(Response::Files(self.list(&directory).await?)),
            Request::ReadFile { path } => {
                let resolved = self.resolve(&path)?;
                let content = tokio::fs::read(&resolved).await.map_err(|e| map_io(e, &path))?;
                Ok(Response::Content(content))
            }
            Request::WriteFile { path, content } => {
                Ok(Response::Written { size: self.write(&path, content).await? })
            }
            other => Err(Error::Remote(format!(
                "the local filesystem store does not support {} requests",
                other.op()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_client::{ConnectionConfig, StorageClient};
    use std::sync::Arc;

    async fn client_for(root: &Path) -> StorageClient {
        let doc = format!(
            "<configuration><property><name>fs.defaultFS</name><value>file://{}</value></property></configuration>",
            root.display()
        );
        let config = ConnectionConfig::from_site_document("core-site.xml", &doc).unwrap();
        StorageClient::connect(config, Arc::new(LocalFsBackend::new(root))).await.unwrap()
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_for(dir.path()).await;

        let size = client.write_file("/out/hello.txt", b"Hello\nWorld!\n".to_vec()).await.unwrap();
        assert_eq!(size, 13);
        let content = client.read_file("/out/hello.txt").await.unwrap();
        assert_eq!(content, b"Hello\nWorld!\n");
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_for(dir.path()).await;
        client.write_file("a.txt", b"first version".to_vec()).await.unwrap();
        client.write_file("a.txt", b"second".to_vec()).await.unwrap();
        assert_eq!(client.read_file("a.txt").await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn list_skips_directories_and_staging_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_for(dir.path()).await;
        client.write_file("/in/one.txt", b"1".to_vec()).await.unwrap();
        client.write_file("/in/two.txt", b"22".to_vec()).await.unwrap();
        client.write_file("/in/nested/three.txt", b"333".to_vec()).await.unwrap();
        std::fs::write(dir.path().join("in/.four.txt.0b7c.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("in/five.tmp"), b"55555").unwrap();

        let files = client.list_files("/in").await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(names, vec!["/in/five.tmp", "/in/one.txt", "/in/two.txt"]);
        assert_eq!(files[2].size, 2);
        assert!(files[0].modified > 0);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_for(dir.path()).await;
        let err = client.read_file("/nope.txt").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn parent_components_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_for(dir.path()).await;
        let err = client.read_file("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
    }

    #[tokio::test]
    async fn row_operations_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let client = client_for(dir.path()).await;
        let err = client.increment("t", "r", "f", "q", 1).await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
    }
}

//! Payload sources for managed providers.

use std::path::{Path, PathBuf};

use crate::provider::{ProviderError, VehicleType};

#[derive(Debug, Clone)]
pub enum Vehicle {
    /// Payload read from a local file.
    File { path: PathBuf },
    /// Payload downloaded from `url`, cached at `path`.
    Http { url: String, path: PathBuf },
}

impl Vehicle {
    pub fn vehicle_type(&self) -> VehicleType {
        match self {
            Vehicle::File { .. } => VehicleType::File,
            Vehicle::Http { .. } => VehicleType::Http,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Vehicle::File { path } | Vehicle::Http { path, .. } => path,
        }
    }

    /// Fetch the payload.
    pub async fn read(&self) -> Result<Vec<u8>, ProviderError> {
        match self {
            Vehicle::File { path } => tokio::fs::read(path)
                .await
                .map_err(|source| ProviderError::Read {
                    path: path.clone(),
                    source,
                }),
            Vehicle::Http { url, path } => {
                let bytes = download(url).await?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|source| ProviderError::Write {
                            path: parent.to_path_buf(),
                            source,
                        })?;
                }
                tokio::fs::write(path, &bytes)
                    .await
                    .map_err(|source| ProviderError::Write {
                        path: path.clone(),
                        source,
                    })?;
                Ok(bytes)
            }
        }
    }
}

async fn download(url: &str) -> Result<Vec<u8>, ProviderError> {
    let to_err = |source| ProviderError::Download {
        url: url.to_string(),
        source,
    };
    let res = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(to_err)?;
    let body = res.bytes().await.map_err(to_err)?;
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_vehicle_reads_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.txt");
        std::fs::write(&path, b"example.com\n").unwrap();

        let v = Vehicle::File { path: path.clone() };
        assert_eq!(v.vehicle_type(), VehicleType::File);
        assert_eq!(v.read().await.unwrap(), b"example.com\n");
    }

    #[tokio::test]
    async fn test_missing_file_is_read_error() {
        let v = Vehicle::File {
            path: PathBuf::from("/nonexistent/tunnel-hub/payload.txt"),
        };
        assert!(matches!(v.read().await, Err(ProviderError::Read { .. })));
    }
}

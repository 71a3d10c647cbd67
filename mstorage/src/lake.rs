use crate::config::StorageConfig;
use crate::errors::Result;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// One raw export file covering the inclusive source id range `[first, last]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub first: u64,
    pub last: u64,
    pub path: PathBuf,
}

/// Directory of raw per-batch export files, written verbatim as the source
/// returned them.
pub struct Lake {
    config: StorageConfig,
}

impl Lake {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.raw_path).await?;
        Ok(Self { config })
    }

    fn batch_name(first: u64, last: u64) -> String {
        format!("{first:06}-{last:06}.xml")
    }

    pub fn batch_path(&self, first: u64, last: u64) -> PathBuf {
        self.config.raw_path.join(Self::batch_name(first, last))
    }

    pub async fn batch_exists(&self, first: u64, last: u64) -> bool {
        tokio::fs::try_exists(self.batch_path(first, last))
            .await
            .unwrap_or(false)
    }

    /// Writes one batch. The bytes land in a hidden sibling first and are
    /// renamed into place, so a reader never observes a partial batch.
    pub async fn write_batch(&self, first: u64, last: u64, bytes: &[u8]) -> Result<BatchFile> {
        let path = self.batch_path(first, last);
        let staging = self
            .config
            .raw_path
            .join(format!(".{}.part", Self::batch_name(first, last)));

        let mut file = tokio::fs::File::create(&staging).await?;
        if let Err(err) = file.write_all(bytes).await {
            drop(file);
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err.into());
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, &path).await?;

        Ok(BatchFile { first, last, path })
    }

    /// Lists every complete batch file, ordered by the first id it covers.
    pub async fn list_batches(&self) -> Result<Vec<BatchFile>> {
        let mut batches = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.raw_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((first, last)) = parse_batch_name(name) {
                batches.push(BatchFile {
                    first,
                    last,
                    path: entry.path(),
                });
            } else {
                log::debug!("ignoring non-batch file {name} in raw directory");
            }
        }
        batches.sort_by_key(|b| (b.first, b.last));
        Ok(batches)
    }

    pub async fn read_batch(&self, batch: &BatchFile) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&batch.path).await?)
    }
}

fn parse_batch_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".xml")?;
    let (first, last) = stem.split_once('-')?;
    Some((first.parse().ok()?, last.parse().ok()?))
}

//! Partitioned JSON-lines files for [`DataSource::export`](super::DataSource::export).

use std::path::{Path, PathBuf};

use futures_util::TryStreamExt;
use tokio::{fs::File, io::AsyncWriteExt, io::BufWriter};

use crate::Error;

use super::{Row, RowStream};

pub fn partition_file_name(index: usize) -> String {
    format!("part-{index}.jsonl")
}

/// Fails fast unless `directory` exists. Callers run this before touching
/// the network.
pub fn ensure_directory(directory: &Path) -> Result<(), Error> {
    if directory.is_dir() {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "directory {} not found",
            directory.display()
        )))
    }
}

/// Writes one result set into `directory`, starting a new `part-{n}.jsonl`
/// file every `partition_size` rows. An empty result writes no file.
///
/// The first failing row aborts the export and the files this call created
/// are removed on a best-effort basis. Files already in the directory that
/// this call never opened are left alone.
pub async fn write_partitions(
    directory: &Path,
    partition_size: usize,
    mut rows: RowStream,
) -> Result<Vec<PathBuf>, Error> {
    let mut partitions = Partitions {
        directory,
        partition_size: partition_size.max(1),
        created: Vec::new(),
        current: None,
    };
    let written = async {
        while let Some(row) = rows.try_next().await? {
            partitions.write(&row).await?;
        }
        partitions.finish().await
    }
    .await;

    match written {
        Ok(()) => Ok(partitions.created),
        Err(e) => {
            drop(partitions.current.take());
            for path in &partitions.created {
                if let Err(remove_err) = tokio::fs::remove_file(path).await {
                    tracing::warn!(path = %path.display(), "failed to remove partial export file: {remove_err}");
                }
            }
            Err(Error::Export(e.to_string()))
        }
    }
}

struct Partitions<'a> {
    directory: &'a Path,
    partition_size: usize,
    created: Vec<PathBuf>,
    current: Option<(BufWriter<File>, usize)>,
}

impl Partitions<'_> {
    async fn write(&mut self, row: &Row) -> Result<(), Error> {
        let (mut writer, rows) = match self.current.take() {
            Some((writer, rows)) if rows < self.partition_size => (writer, rows),
            Some((mut full, _)) => {
                full.flush().await?;
                tracing::debug!(partition = self.created.len() - 1, "partition written");
                self.open().await?
            }
            None => self.open().await?,
        };
        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        self.current = Some((writer, rows + 1));
        Ok(())
    }

    async fn open(&mut self) -> Result<(BufWriter<File>, usize), Error> {
        let path = self
            .directory
            .join(partition_file_name(self.created.len()));
        let file = File::create(&path).await?;
        self.created.push(path);
        Ok((BufWriter::new(file), 0))
    }

    async fn finish(&mut self) -> Result<(), Error> {
        if let Some((mut writer, _)) = self.current.take() {
            writer.flush().await?;
            tracing::debug!(partition = self.created.len() - 1, "partition written");
        }
        Ok(())
    }
}

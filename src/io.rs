use crate::entity::Entity;
use crate::CatalogResult;
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

/// Compression applied to a delta file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Picks compression from the file extension (`.gz`, `.zst`).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()).unwrap_or_default() {
            "gz" => Compression::Gzip,
            "zst" => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeltaMeta {
    /// just the file name, for logs
    pub name_hint: String,
    pub compression: Compression,
}

impl DeltaMeta {
    pub fn for_path(path: &Path) -> Self {
        Self {
            name_hint: path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string(),
            compression: Compression::from_path(path),
        }
    }
}

/// Wraps a raw reader with the decompression named by `meta`.
/// Returns an AsyncRead suitable for csv_async.
pub fn build_delta_reader<R>(raw: R, meta: &DeltaMeta) -> impl AsyncRead + Unpin + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    // Use a larger buffer for fewer syscalls (1 MiB)
    let buf = BufReader::with_capacity(1 << 20, raw);
    let reader: Box<dyn AsyncRead + Unpin + Send> = match meta.compression {
        Compression::Gzip => Box::new(GzipDecoder::new(buf)),
        Compression::Zstd => Box::new(ZstdDecoder::new(buf)),
        Compression::None => Box::new(buf),
    };
    reader
}

/// Opens a delta file for streaming, front to back.
pub async fn reader_from_path(path: &Path) -> CatalogResult<(impl AsyncRead + Unpin + Send, DeltaMeta)> {
    let file = File::open(path).await?;
    let meta = DeltaMeta::for_path(path);
    Ok((build_delta_reader(file, &meta), meta))
}

/// Line writer for the delta file: a header, then one line per entity.
pub struct DeltaWriter {
    inner: Box<dyn AsyncWrite + Unpin + Send>,
    meta: DeltaMeta,
    rows: u64,
}

impl DeltaWriter {
    /// Creates (truncating) the delta file at `path`.
    pub async fn create(path: &Path) -> CatalogResult<Self> {
        let file = File::create(path).await?;
        Ok(Self::new(file, DeltaMeta::for_path(path)))
    }

    pub fn new<W>(raw: W, meta: DeltaMeta) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let buf = BufWriter::with_capacity(1 << 20, raw);
        let inner: Box<dyn AsyncWrite + Unpin + Send> = match meta.compression {
            Compression::Gzip => Box::new(GzipEncoder::new(buf)),
            Compression::Zstd => Box::new(ZstdEncoder::new(buf)),
            Compression::None => Box::new(buf),
        };
        Self {
            inner,
            meta,
            rows: 0,
        }
    }

    pub fn meta(&self) -> &DeltaMeta {
        &self.meta
    }

    pub async fn write_header(&mut self) -> CatalogResult<()> {
        self.write_line(&Entity::header_line()).await
    }

    pub async fn write_entity(&mut self, entity: &Entity) -> CatalogResult<()> {
        self.write_line(&entity.to_csv_line()).await?;
        self.rows += 1;
        Ok(())
    }

    /// Data rows written so far, header excluded.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flushes buffers and finalizes any compressed stream. Returns the row count.
    pub async fn finish(mut self) -> CatalogResult<u64> {
        self.inner.shutdown().await?;
        Ok(self.rows)
    }

    async fn write_line(&mut self, line: &str) -> CatalogResult<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        Ok(())
    }
}

//! Compression filters applied to archive streams.

use crate::utils::{BundleError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};

/// Default zstd level
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Compression {
    Zstd { level: i32 },
    None,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd {
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl Compression {
    /// Parse a configured method name (`zstd`, `none`)
    pub fn from_config(method: &str, level: i32) -> Result<Self> {
        match method.to_ascii_lowercase().as_str() {
            "zstd" => Ok(Compression::Zstd {
                level: level.clamp(1, 22),
            }),
            "none" | "" => Ok(Compression::None),
            other => Err(BundleError::Config(format!(
                "unsupported compression method: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::Zstd { .. } => "zstd",
            Compression::None => "none",
        }
    }

    /// Archive file extension, tar included
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Zstd { .. } => "tar.zst",
            Compression::None => "tar",
        }
    }

    /// Detect the filter from an archive name
    pub fn from_archive_name(name: &str) -> Option<Self> {
        if name.ends_with(".tar.zst") {
            Some(Compression::default())
        } else if name.ends_with(".tar") {
            Some(Compression::None)
        } else {
            None
        }
    }

    /// Wrap a spool file in the compressing writer
    pub fn writer(&self, file: File) -> io::Result<CompressedWriter> {
        match self {
            Compression::Zstd { level } => Ok(CompressedWriter::Zstd(
                zstd::stream::write::Encoder::new(file, *level)?,
            )),
            Compression::None => Ok(CompressedWriter::Plain(file)),
        }
    }

    /// Wrap an archive source in the matching decompressor
    pub fn reader<'a, R: Read + Send + 'a>(&self, source: R) -> io::Result<Box<dyn Read + Send + 'a>> {
        match self {
            Compression::Zstd { .. } => Ok(Box::new(zstd::stream::read::Decoder::new(source)?)),
            Compression::None => Ok(Box::new(source)),
        }
    }
}

/// Compressing writer over a spooled archive file
pub enum CompressedWriter {
    Zstd(zstd::stream::write::Encoder<'static, File>),
    Plain(File),
}

impl CompressedWriter {
    /// Flush the compressor's trailer and hand back the spool file
    pub fn finish(self) -> io::Result<File> {
        let mut file = match self {
            CompressedWriter::Zstd(encoder) => encoder.finish()?,
            CompressedWriter::Plain(file) => file,
        };
        file.flush()?;
        Ok(file)
    }
}

impl Write for CompressedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressedWriter::Zstd(encoder) => encoder.write(buf),
            CompressedWriter::Plain(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressedWriter::Zstd(encoder) => encoder.flush(),
            CompressedWriter::Plain(file) => file.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    #[test]
    fn test_from_config() {
        assert_eq!(
            Compression::from_config("zstd", 40).unwrap(),
            Compression::Zstd { level: 22 }
        );
        assert_eq!(Compression::from_config("none", 3).unwrap(), Compression::None);
        assert!(Compression::from_config("lz4", 3).is_err());
    }

    #[test]
    fn test_from_archive_name() {
        assert_eq!(
            Compression::from_archive_name("part_001.tar.zst"),
            Some(Compression::default())
        );
        assert_eq!(
            Compression::from_archive_name("pg_control.tar"),
            Some(Compression::None)
        );
        assert_eq!(Compression::from_archive_name("manifest.json"), None);
    }

    #[test]
    fn test_zstd_writer_reader() -> io::Result<()> {
        let compression = Compression::default();
        let mut writer = compression.writer(tempfile::tempfile()?)?;
        writer.write_all(&vec![7u8; 64 * 1024])?;
        let mut file = writer.finish()?;

        assert!(file.metadata()?.len() < 64 * 1024);

        file.seek(SeekFrom::Start(0))?;
        let mut decoded = Vec::new();
        compression.reader(file)?.read_to_end(&mut decoded)?;
        assert_eq!(decoded, vec![7u8; 64 * 1024]);
        Ok(())
    }
}

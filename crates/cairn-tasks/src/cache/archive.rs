//! Transfer archives for remote storage

use std::fs::{self, File};
use std::io;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::debug;

use crate::error::CacheError;

/// Pack the artifact directory `dir` into a gzipped tarball at `archive`
pub fn compress(dir: &Path, archive: &Path) -> Result<(), CacheError> {
    let archive_error = |source: io::Error| CacheError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let partial = archive.with_extension("partial");
    let file = File::create(&partial).map_err(archive_error)?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir).map_err(archive_error)?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(archive_error)?;

    fs::rename(&partial, archive).map_err(archive_error)?;
    debug!(archive = %archive.display(), "compressed artifact");
    Ok(())
}

/// Unpack the tarball at `archive` into `dest`
pub fn decompress(archive: &Path, dest: &Path) -> Result<(), CacheError> {
    let archive_error = |source: io::Error| CacheError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::open(archive).map_err(archive_error)?;
    let mut tarball = Archive::new(GzDecoder::new(file));
    tarball.set_preserve_permissions(true);
    tarball.unpack(dest).map_err(archive_error)?;
    debug!(archive = %archive.display(), dest = %dest.display(), "decompressed artifact");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_compress_and_decompress() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        fs::create_dir_all(source.join("bin")).unwrap();
        fs::write(source.join("bin/tool"), "#!/bin/sh\n").unwrap();
        fs::write(source.join(".manifest.json"), "{}").unwrap();

        let archive = temp.path().join("artifact.tar.gz");
        compress(&source, &archive).unwrap();
        assert!(archive.exists());
        assert!(!archive.with_extension("partial").exists());

        let dest = temp.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        decompress(&archive, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("bin/tool")).unwrap(), "#!/bin/sh\n");
        assert!(dest.join(".manifest.json").exists());
    }

    #[test]
    fn test_decompress_missing_archive() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            decompress(&temp.path().join("missing.tar.gz"), temp.path()),
            Err(CacheError::Archive { .. })
        ));
    }
}

use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Component, Path, PathBuf},
};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tar::Archive;
use tracing::{debug, warn};
use zip::read::ZipArchive;

use crate::error::{DownloadError, DownloadResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    #[default]
    Zip,
    TarGz,
    TarBz2,
}

impl ArchiveFormat {
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
        }
    }
}

/// Expands `archive_path` under `destination`, then deletes the archive.
///
/// Not atomic: a failure part way leaves whatever was already written.
pub fn materialize(archive_path: &Path, destination: &Path, format: ArchiveFormat) -> DownloadResult<()> {
    fs::create_dir_all(destination)
        .map_err(|err| DownloadError::io(format!("create {}", destination.display()), err))?;

    let file = File::open(archive_path)
        .map_err(|err| DownloadError::io(format!("open {}", archive_path.display()), err))?;
    match format {
        ArchiveFormat::Zip => extract_zip(archive_path, file, destination)?,
        ArchiveFormat::TarGz => extract_tar(archive_path, GzDecoder::new(file), destination)?,
        ArchiveFormat::TarBz2 => extract_tar(archive_path, BzDecoder::new(file), destination)?,
    }

    fs::remove_file(archive_path)
        .map_err(|err| DownloadError::io(format!("remove {}", archive_path.display()), err))?;
    debug!(
        "expanded {} into {}",
        archive_path.display(),
        destination.display()
    );
    Ok(())
}

fn extract_zip(archive_path: &Path, file: File, destination: &Path) -> DownloadResult<()> {
    let archive_error = |err: zip::result::ZipError| match err {
        zip::result::ZipError::Io(source) => {
            DownloadError::io(format!("read {}", archive_path.display()), source)
        }
        other => DownloadError::Archive {
            path: archive_path.to_path_buf(),
            message: other.to_string(),
        },
    };

    let mut archive = ZipArchive::new(file).map_err(archive_error)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(archive_error)?;
        let relative = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| DownloadError::UnsafeEntry(entry.name().to_string()))?;
        let dest = destination.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&dest)
                .map_err(|err| DownloadError::io(format!("create {}", dest.display()), err))?;
        } else {
            write_entry(&mut entry, &dest)?;
        }
    }
    Ok(())
}

fn extract_tar<R: Read>(archive_path: &Path, reader: R, destination: &Path) -> DownloadResult<()> {
    let read_error =
        |err: io::Error| DownloadError::io(format!("read {}", archive_path.display()), err);

    let mut archive = Archive::new(reader);
    for entry in archive.entries().map_err(read_error)? {
        let mut entry = entry.map_err(read_error)?;
        let path = entry.path().map_err(read_error)?.into_owned();
        let relative = enclosed(&path)
            .ok_or_else(|| DownloadError::UnsafeEntry(path.display().to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest = destination.join(&relative);
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&dest)
                .map_err(|err| DownloadError::io(format!("create {}", dest.display()), err))?;
        } else if kind.is_file() {
            write_entry(&mut entry, &dest)?;
        } else {
            // Links and special files are never materialized.
            warn!("skipping {kind:?} entry {}", relative.display());
        }
    }
    Ok(())
}

fn write_entry(entry: &mut impl Read, dest: &Path) -> DownloadResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| DownloadError::io(format!("create {}", parent.display()), err))?;
    }
    let mut outfile = File::create(dest)
        .map_err(|err| DownloadError::io(format!("create {}", dest.display()), err))?;
    io::copy(entry, &mut outfile)
        .map_err(|err| DownloadError::io(format!("write {}", dest.display()), err))?;
    Ok(())
}

/// Relative form of an archive path, `None` if it would land outside the destination.
fn enclosed(path: &Path) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::{FileOptions, ZipWriter};

    use super::*;

    fn build_zip(path: &Path, entries: &[(&str, Option<&[u8]>)]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        let options = FileOptions::default();
        for (name, contents) in entries {
            match contents {
                Some(bytes) => {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(bytes).unwrap();
                }
                None => writer.add_directory(*name, options).unwrap(),
            }
        }
        writer.finish().unwrap();
    }

    #[test]
    fn zip_round_trip_reproduces_tree_and_removes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("model.zip");
        build_zip(
            &archive,
            &[
                ("weights/", None),
                ("weights/layer0.bin", Some(b"layer zero")),
                ("weights/nested/deep/layer1.bin", Some(b"layer one")),
                ("empty/", None),
                ("labels.txt", Some(b"cat\ndog\n")),
            ],
        );
        let dest = dir.path().join("expanded");

        materialize(&archive, &dest, ArchiveFormat::Zip).unwrap();

        assert!(!archive.exists());
        assert_eq!(fs::read(dest.join("weights/layer0.bin")).unwrap(), b"layer zero");
        assert_eq!(
            fs::read(dest.join("weights/nested/deep/layer1.bin")).unwrap(),
            b"layer one"
        );
        assert_eq!(fs::read(dest.join("labels.txt")).unwrap(), b"cat\ndog\n");
        assert!(dest.join("empty").is_dir());
    }

    #[test]
    fn zip_entry_escaping_destination_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        build_zip(&archive, &[("../outside.txt", Some(b"nope"))]);

        let err = materialize(&archive, &dir.path().join("out"), ArchiveFormat::Zip).unwrap_err();
        assert!(matches!(err, DownloadError::UnsafeEntry(_)));
        assert!(!dir.path().join("outside.txt").exists());
        assert!(archive.exists());
    }

    #[test]
    fn corrupt_archive_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();

        let err = materialize(&archive, &dir.path().join("out"), ArchiveFormat::Zip).unwrap_err();
        assert!(matches!(err, DownloadError::Archive { .. }));
    }

    #[test]
    fn tar_gz_is_expanded_with_nested_paths() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("model.tar.gz");
        {
            let encoder = flate2::write::GzEncoder::new(
                File::create(&archive).unwrap(),
                flate2::Compression::default(),
            );
            let mut builder = tar::Builder::new(encoder);
            let contents = b"tokenizer";
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "assets/tokenizer.model", &contents[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let dest = dir.path().join("expanded");

        materialize(&archive, &dest, ArchiveFormat::TarGz).unwrap();

        assert!(!archive.exists());
        assert_eq!(
            fs::read(dest.join("assets/tokenizer.model")).unwrap(),
            b"tokenizer"
        );
    }

    #[test]
    fn tar_links_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("model.tar.gz");
        {
            let encoder = flate2::write::GzEncoder::new(
                File::create(&archive).unwrap(),
                flate2::Compression::default(),
            );
            let mut builder = tar::Builder::new(encoder);
            let contents = b"weights";
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, "model/weights.bin", &contents[..])
                .unwrap();
            for (kind, name) in [
                (tar::EntryType::Symlink, "model/latest.bin"),
                (tar::EntryType::Link, "model/copy.bin"),
            ] {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(kind);
                header.set_size(0);
                header.set_mode(0o777);
                header.set_link_name("weights.bin").unwrap();
                builder.append_data(&mut header, name, io::empty()).unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap();
        }
        let dest = dir.path().join("expanded");

        materialize(&archive, &dest, ArchiveFormat::TarGz).unwrap();

        assert_eq!(fs::read(dest.join("model/weights.bin")).unwrap(), b"weights");
        assert!(fs::symlink_metadata(dest.join("model/latest.bin")).is_err());
        assert!(fs::symlink_metadata(dest.join("model/copy.bin")).is_err());
    }

    #[test]
    fn enclosed_rejects_parent_and_absolute_paths() {
        assert_eq!(enclosed(Path::new("./a/b")), Some(PathBuf::from("a/b")));
        assert_eq!(enclosed(Path::new("a/../b")), None);
        assert_eq!(enclosed(Path::new("/etc/passwd")), None);
    }
}

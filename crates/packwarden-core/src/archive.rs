//! Extraction of package image layers
//!
//! Layers are tar streams, optionally gzip compressed. Extraction refuses
//! entries that could escape the destination directory.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::{Component, Path};
use tar::{Archive, Builder, EntryType, Header};

use crate::error::{CoreError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Permission bits kept from archive entries
const MODE_MASK: u32 = 0o700;

fn archive_for(data: &[u8]) -> Archive<Box<dyn Read + '_>> {
    let reader: Box<dyn Read + '_> = if data.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(data))
    } else {
        Box::new(Cursor::new(data))
    };
    Archive::new(reader)
}

/// Extract a layer into `dest`, creating it if needed.
///
/// - entries whose path contains `..` are rejected
/// - permission bits are reduced to the owner's
/// - symlinks are only created when their target is relative
/// - other special entries (hard links, devices) are skipped
pub fn extract_layer(data: &[u8], dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest)?;
    let mut archive = archive_for(data);
    let mut extracted = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let rel_text = rel.to_string_lossy().to_string();

        if rel_text.contains("..") || rel.is_absolute() {
            return Err(CoreError::UnsafeArchiveEntry { path: rel_text });
        }

        let rel: std::path::PathBuf = rel
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        if rel.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(&rel);
        let mode = entry.header().mode().unwrap_or(0o600) & MODE_MASK;

        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(&target)?;
                set_mode(&target, mode | 0o700)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = std::fs::File::create(&target)?;
                std::io::copy(&mut entry, &mut file)?;
                set_mode(&target, mode)?;
                extracted += 1;
            }
            EntryType::Symlink => {
                let Some(link) = entry.link_name()? else {
                    continue;
                };
                if link.is_absolute() {
                    tracing::debug!(path = %rel_text, "skip absolute symlink");
                    continue;
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if target.symlink_metadata().is_ok() {
                    std::fs::remove_file(&target)?;
                }
                std::os::unix::fs::symlink(link.as_ref(), &target)?;
                extracted += 1;
            }
            other => {
                tracing::debug!(path = %rel_text, kind = ?other, "skip unsupported entry");
            }
        }
    }

    Ok(extracted)
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Read every regular file of a layer into memory
pub fn read_layer_files(data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = archive_for(data);
    let mut contents = BTreeMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        contents.insert(path, buf);
    }

    Ok(contents)
}

/// Build a gzip compressed layer from in-memory files
pub fn build_layer(files: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    for (path, content) in files {
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, path, *content)?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn raw_tar(build: impl FnOnce(&mut Builder<Vec<u8>>)) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        build(&mut builder);
        builder.into_inner().unwrap()
    }

    fn append_raw_path(builder: &mut Builder<Vec<u8>>, path: &str, content: &[u8]) {
        // Header::set_path refuses "..", so write the name bytes directly
        let mut header = Header::new_old();
        let name = &mut header.as_old_mut().name;
        name[..path.len()].copy_from_slice(path.as_bytes());
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, content).unwrap();
    }

    #[test]
    fn test_extract_gzip_layer() {
        let layer = build_layer(&[
            ("Chart.yaml", b"name: echo\n"),
            ("templates/deployment.yaml", b"kind: Deployment\n"),
            ("hooks/startup", b"#!/bin/sh\n"),
        ])
        .unwrap();

        let dir = TempDir::new().unwrap();
        let count = extract_layer(&layer, dir.path()).unwrap();

        assert_eq!(count, 3);
        assert!(dir.path().join("templates/deployment.yaml").is_file());

        let mode = std::fs::metadata(dir.path().join("hooks/startup"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_extract_plain_tar() {
        let data = raw_tar(|b| append_raw_path(b, "values.yaml", b"a: 1\n"));

        let dir = TempDir::new().unwrap();
        extract_layer(&data, dir.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("values.yaml")).unwrap(),
            "a: 1\n"
        );
    }

    #[test]
    fn test_reject_parent_traversal() {
        let data = raw_tar(|b| append_raw_path(b, "../escape.txt", b"x"));

        let dir = TempDir::new().unwrap();
        let err = extract_layer(&data, &dir.path().join("inner")).unwrap_err();

        assert!(matches!(err, CoreError::UnsafeArchiveEntry { .. }));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_symlinks_must_be_relative() {
        let data = raw_tar(|b| {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            b.append_link(&mut header, "relative", "target.txt").unwrap();

            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            b.append_link(&mut header, "absolute", "/etc/passwd").unwrap();
        });

        let dir = TempDir::new().unwrap();
        extract_layer(&data, dir.path()).unwrap();

        assert!(dir.path().join("relative").symlink_metadata().is_ok());
        assert!(dir.path().join("absolute").symlink_metadata().is_err());
    }

    #[test]
    fn test_read_layer_files() {
        let layer = build_layer(&[
            ("version.json", br#"{"version": "v1.2.3"}"#),
            ("./changelog.yaml", b"features: []\n"),
        ])
        .unwrap();

        let files = read_layer_files(&layer).unwrap();
        assert!(files.contains_key("version.json"));
        assert!(files.contains_key("changelog.yaml"));
    }
}

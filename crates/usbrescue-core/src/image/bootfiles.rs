//! Raspberry Pi `bootfiles` tar archives.

use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum BootfilesError {
    #[error("'bootfiles' archive doesn't contain '{name}' ({paths:?})")]
    NotFound { name: String, paths: Vec<String> },

    #[error("Found two '{name}' in 'bootfiles' ({paths:?})")]
    Ambiguous { name: String, paths: Vec<String> },

    #[error("'bootfiles'/{0} exists but is not a regular file")]
    NotAFile(String),

    #[error("Invalid tar archive: {0}")]
    Tar(#[from] io::Error),
}

/// `./a/b` and `a/b` name the same member.
fn normalize(path: &Path) -> PathBuf {
    path.components().filter(|c| !matches!(c, Component::CurDir)).collect()
}

pub struct Bootfiles<'a> {
    blob: &'a [u8],
}

impl<'a> Bootfiles<'a> {
    pub fn new(blob: &'a [u8]) -> Self {
        Self { blob }
    }

    /// Contents of the last member matching `path`. Archives can be
    /// updated by appending, so later members shadow earlier ones.
    pub fn member(&self, path: &str) -> Result<Option<Vec<u8>>, BootfilesError> {
        let wanted = normalize(Path::new(path));
        let mut archive = tar::Archive::new(self.blob);
        let mut found = None;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if normalize(&entry.path()?) != wanted {
                continue;
            }
            let kind = entry.header().entry_type();
            if !(kind.is_file() || kind.is_hard_link() || kind.is_symlink()) {
                found = Some(Err(BootfilesError::NotAFile(path.to_string())));
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            found = Some(Ok(data));
        }
        found.transpose()
    }

    /// Fetch `name` from exactly one of `paths`.
    pub fn lookup(&self, name: &str, paths: &[String]) -> Result<Vec<u8>, BootfilesError> {
        debug!(?paths, "Searching in 'bootfiles'");
        let mut hits = Vec::new();
        for path in paths {
            if let Some(data) = self.member(path)? {
                hits.push((path.clone(), data));
            }
        }
        match hits.len() {
            0 => Err(BootfilesError::NotFound {
                name: name.to_string(),
                paths: paths.to_vec(),
            }),
            1 => Ok(hits.remove(0).1),
            _ => Err(BootfilesError::Ambiguous {
                name: name.to_string(),
                paths: hits.into_iter().map(|(p, _)| p).collect(),
            }),
        }
    }

    /// Look `name` up in the SoC subfolder and at the archive root.
    pub fn fetch(&self, subfolder: &str, name: &str) -> Result<Vec<u8>, BootfilesError> {
        self.lookup(name, &[format!("{}/{}", subfolder, name), name.to_string()])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_member_prefers_last_and_normalizes() {
        let tar = archive(&[
            ("./bootcode4.bin", b"old"),
            ("2711/start4.elf", b"elf"),
            ("bootcode4.bin", b"new"),
        ]);
        let files = Bootfiles::new(&tar);
        assert_eq!(files.member("bootcode4.bin").unwrap().unwrap(), b"new");
        assert_eq!(files.member("./2711/start4.elf").unwrap().unwrap(), b"elf");
        assert!(files.member("missing").unwrap().is_none());
    }

    #[test]
    fn test_fetch() {
        let tar = archive(&[("2711/bootcode4.bin", b"bc4"), ("fixup4.dat", b"fx")]);
        let files = Bootfiles::new(&tar);
        assert_eq!(files.fetch("2711", "bootcode4.bin").unwrap(), b"bc4");
        assert_eq!(files.fetch("2711", "fixup4.dat").unwrap(), b"fx");
        assert!(matches!(
            files.fetch("2711", "start4.elf"),
            Err(BootfilesError::NotFound { .. })
        ));
    }

    #[test]
    fn test_fetch_ambiguous() {
        let tar = archive(&[("2712/bootcode5.bin", b"a"), ("bootcode5.bin", b"b")]);
        assert!(matches!(
            Bootfiles::new(&tar).fetch("2712", "bootcode5.bin"),
            Err(BootfilesError::Ambiguous { .. })
        ));
    }
}

//! Exported study archives: `.zip`, `.tar.gz` or an unpacked folder

use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{E2eError, E2eResult};

/// All members of an export, read into memory
#[derive(Debug)]
pub struct ExportArchive {
    path: PathBuf,
    members: BTreeMap<String, Vec<u8>>,
}

impl ExportArchive {
    pub fn open(path: &Path) -> E2eResult<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let members = if path.is_dir() {
            read_dir(path)?
        } else if name.ends_with(".zip") {
            read_zip(path)?
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            read_tar_gz(path)?
        } else {
            return Err(E2eError::Archive(format!(
                "unsupported export format: {}",
                path.display()
            )));
        };

        debug!("Opened {} ({} members)", path.display(), members.len());
        Ok(Self {
            path: path.to_path_buf(),
            members,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Member paths with `/` separators, sorted
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.contains_key(member)
    }

    /// First member whose path ends with `suffix`
    pub fn find(&self, suffix: &str) -> Option<&str> {
        self.members().find(|m| m.ends_with(suffix))
    }

    pub fn read(&self, member: &str) -> E2eResult<&[u8]> {
        self.members
            .get(member)
            .map(Vec::as_slice)
            .ok_or_else(|| E2eError::Archive(format!("{} has no member {member}", self.path.display())))
    }

    pub fn read_to_string(&self, member: &str) -> E2eResult<String> {
        let bytes = self.read(member)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| E2eError::Archive(format!("{member} is not UTF-8: {e}")))
    }

    /// Column names from the first non-comment line of a TSV member
    pub fn tsv_header(&self, member: &str) -> E2eResult<Vec<String>> {
        let text = self.read_to_string(member)?;
        let header = text
            .lines()
            .map(|l| l.trim_start_matches('\u{feff}'))
            .find(|l| !l.trim().is_empty() && !l.starts_with('#'))
            .ok_or_else(|| E2eError::Archive(format!("{member} has no header row")))?;
        Ok(header.split('\t').map(|c| c.trim().to_string()).collect())
    }
}

fn read_dir(root: &Path) -> E2eResult<BTreeMap<String, Vec<u8>>> {
    let mut members = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| E2eError::Archive(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        members.insert(name, std::fs::read(entry.path())?);
    }
    Ok(members)
}

fn read_zip(path: &Path) -> E2eResult<BTreeMap<String, Vec<u8>>> {
    let mut zip = zip::ZipArchive::new(File::open(path)?)?;
    let mut members = BTreeMap::new();
    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes)?;
        members.insert(file.name().to_string(), bytes);
    }
    Ok(members)
}

fn read_tar_gz(path: &Path) -> E2eResult<BTreeMap<String, Vec<u8>>> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));
    let mut members = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        members.insert(name, bytes);
    }
    Ok(members)
}

//! Key metadata persistence: one JSON record per KID per partition.
//!
//! The origin partition is domain-scoped; the archive partition is global
//! (an archived record carries its domain inside). Files are
//! `<kid>.meta`, written via a `.tmp` sibling and renamed into place.

use crate::error::VaultError;
use crate::types::KeyMetadata;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const META_SUFFIX: &str = ".meta";
const TMP_SUFFIX: &str = ".tmp";

pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let root = root.into();
        fs::create_dir_all(root.join("origin"))
            .and_then(|_| fs::create_dir_all(root.join("archive")))
            .map_err(|e| VaultError::store("metadata init", e))?;
        Ok(Self { root })
    }

    // -- origin partition ---------------------------------------------------

    pub fn write_origin(
        &self,
        domain: &str,
        kid: &str,
        meta: &KeyMetadata,
    ) -> Result<(), VaultError> {
        let path = self.origin_path(domain, kid);
        write_record(&path, meta)
    }

    pub fn read_origin(&self, domain: &str, kid: &str) -> Result<KeyMetadata, VaultError> {
        read_record(&self.origin_path(domain, kid), || {
            format!("origin metadata {}/{}", domain, kid)
        })
    }

    pub fn delete_origin(&self, domain: &str, kid: &str) -> Result<(), VaultError> {
        delete_record(&self.origin_path(domain, kid))
    }

    pub fn origin_exists(&self, domain: &str, kid: &str) -> bool {
        self.origin_path(domain, kid).exists()
    }

    pub fn list_origin_kids(&self, domain: &str) -> Result<Vec<String>, VaultError> {
        list_kids(&self.root.join("origin").join(domain))
    }

    // -- archive partition --------------------------------------------------

    pub fn write_archive(&self, kid: &str, meta: &KeyMetadata) -> Result<(), VaultError> {
        let dir = self.root.join("archive");
        fs::create_dir_all(&dir).map_err(|e| VaultError::store("metadata write", e))?;
        write_record(&dir.join(format!("{}{}", kid, META_SUFFIX)), meta)
    }

    pub fn read_archived(&self, kid: &str) -> Result<KeyMetadata, VaultError> {
        read_record(&self.archive_path(kid), || format!("archive metadata {}", kid))
    }

    pub fn delete_archived(&self, kid: &str) -> Result<(), VaultError> {
        delete_record(&self.archive_path(kid))
    }

    pub fn archived_exists(&self, kid: &str) -> bool {
        self.archive_path(kid).exists()
    }

    pub fn list_archived_kids(&self) -> Result<Vec<String>, VaultError> {
        list_kids(&self.root.join("archive"))
    }

    /// Every archived record, parsed. Janitor's scan.
    pub fn read_all_archived(&self) -> Result<Vec<KeyMetadata>, VaultError> {
        let mut records = Vec::new();
        for kid in self.list_archived_kids()? {
            records.push(self.read_archived(&kid)?);
        }
        Ok(records)
    }

    fn origin_path(&self, domain: &str, kid: &str) -> PathBuf {
        self.root
            .join("origin")
            .join(domain)
            .join(format!("{}{}", kid, META_SUFFIX))
    }

    fn archive_path(&self, kid: &str) -> PathBuf {
        self.root.join("archive").join(format!("{}{}", kid, META_SUFFIX))
    }
}

fn write_record(path: &Path, meta: &KeyMetadata) -> Result<(), VaultError> {
    fs::create_dir_all(path.parent().unwrap())
        .map_err(|e| VaultError::store("metadata write", e))?;
    let json =
        serde_json::to_string_pretty(meta).map_err(|e| VaultError::store("metadata encode", e))?;
    let mut tmp_name = path.file_name().unwrap().to_os_string();
    tmp_name.push(TMP_SUFFIX);
    let tmp = path.with_file_name(tmp_name);
    let result = fs::write(&tmp, &json).and_then(|_| fs::rename(&tmp, path));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(VaultError::store("metadata write", e));
    }
    Ok(())
}

fn read_record(
    path: &Path,
    describe: impl FnOnce() -> String,
) -> Result<KeyMetadata, VaultError> {
    let data = fs::read_to_string(path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            VaultError::not_found(describe())
        } else {
            VaultError::store("metadata read", e)
        }
    })?;
    serde_json::from_str(&data).map_err(|e| VaultError::store("metadata decode", e))
}

fn delete_record(path: &Path) -> Result<(), VaultError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VaultError::store("metadata delete", e)),
    }
}

fn list_kids(dir: &Path) -> Result<Vec<String>, VaultError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VaultError::store("metadata scan", e)),
    };
    let mut kids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| VaultError::store("metadata scan", e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(kid) = name.strip_suffix(META_SUFFIX) {
            kids.push(kid.to_string());
        }
    }
    Ok(kids)
}

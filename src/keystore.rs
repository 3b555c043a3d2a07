//! Durable PEM storage, one file per KID per partition.
//!
//! Layout under the store root (internal to this module):
//! ```text
//! <root>/<DOMAIN>/private/<kid>.pem   mode 0o600
//! <root>/<DOMAIN>/public/<kid>.pem    mode 0o644
//! ```
//! Writes go to a `.tmp` sibling first and are renamed into place; a failed
//! write removes its temps and both final paths so observers never see a
//! half-written pair.

use crate::error::VaultError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const PEM_SUFFIX: &str = ".pem";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Partition {
    Private,
    Public,
}

impl Partition {
    fn dir_name(self) -> &'static str {
        match self {
            Partition::Private => "private",
            Partition::Public => "public",
        }
    }

    #[cfg(unix)]
    fn mode(self) -> u32 {
        match self {
            Partition::Private => 0o600,
            Partition::Public => 0o644,
        }
    }
}

pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| VaultError::store("keystore init", e))?;
        Ok(Self { root })
    }

    /// Write both PEMs atomically with respect to observers. Any failure
    /// after a temp file exists removes all temps and both final paths.
    pub fn save_key_pair(
        &self,
        domain: &str,
        kid: &str,
        public_pem: &str,
        private_pem: &str,
    ) -> Result<(), VaultError> {
        let private_final = self.pem_path(domain, Partition::Private, kid);
        let public_final = self.pem_path(domain, Partition::Public, kid);
        let private_tmp = tmp_sibling(&private_final);
        let public_tmp = tmp_sibling(&public_final);

        let result = (|| -> std::io::Result<()> {
            fs::create_dir_all(private_final.parent().unwrap())?;
            fs::create_dir_all(public_final.parent().unwrap())?;
            write_with_mode(&private_tmp, private_pem, Partition::Private)?;
            write_with_mode(&public_tmp, public_pem, Partition::Public)?;
            fs::rename(&private_tmp, &private_final)?;
            fs::rename(&public_tmp, &public_final)?;
            Ok(())
        })();

        if let Err(e) = result {
            for path in [&private_tmp, &public_tmp, &private_final, &public_final] {
                let _ = fs::remove_file(path);
            }
            return Err(VaultError::store("key pair write", e));
        }
        Ok(())
    }

    pub fn load_private_key(&self, domain: &str, kid: &str) -> Result<Zeroizing<String>, VaultError> {
        self.read_pem(domain, Partition::Private, kid)
            .map(Zeroizing::new)
    }

    pub fn load_public_key(&self, domain: &str, kid: &str) -> Result<String, VaultError> {
        self.read_pem(domain, Partition::Public, kid)
    }

    pub fn list_private_kids(&self, domain: &str) -> Result<Vec<String>, VaultError> {
        self.list_kids(domain, Partition::Private)
    }

    pub fn list_public_kids(&self, domain: &str) -> Result<Vec<String>, VaultError> {
        self.list_kids(domain, Partition::Public)
    }

    /// Idempotent: deleting a missing key is success.
    pub fn delete_private_key(&self, domain: &str, kid: &str) -> Result<(), VaultError> {
        self.delete_pem(domain, Partition::Private, kid)
    }

    pub fn delete_public_key(&self, domain: &str, kid: &str) -> Result<(), VaultError> {
        self.delete_pem(domain, Partition::Public, kid)
    }

    /// Remove `.tmp` files left by a crashed writer. Run at process start.
    pub fn clean_tmp_residue(&self, domain: &str) -> Result<usize, VaultError> {
        let mut removed = 0;
        for partition in [Partition::Private, Partition::Public] {
            let dir = self.partition_dir(domain, partition);
            for name in list_dir(&dir)? {
                if name.ends_with(TMP_SUFFIX) {
                    let _ = fs::remove_file(dir.join(&name));
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Domains that have any material on disk.
    pub fn domains(&self) -> Result<Vec<String>, VaultError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultError::store("keystore scan", e)),
        };
        let mut domains = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| VaultError::store("keystore scan", e))?;
            if entry.path().is_dir() {
                domains.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(domains)
    }

    fn partition_dir(&self, domain: &str, partition: Partition) -> PathBuf {
        self.root.join(domain).join(partition.dir_name())
    }

    fn pem_path(&self, domain: &str, partition: Partition, kid: &str) -> PathBuf {
        self.partition_dir(domain, partition)
            .join(format!("{}{}", kid, PEM_SUFFIX))
    }

    fn read_pem(&self, domain: &str, partition: Partition, kid: &str) -> Result<String, VaultError> {
        let path = self.pem_path(domain, partition, kid);
        fs::read_to_string(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                VaultError::not_found(format!("{} key {}/{}", partition.dir_name(), domain, kid))
            } else {
                VaultError::store("key read", e)
            }
        })
    }

    fn list_kids(&self, domain: &str, partition: Partition) -> Result<Vec<String>, VaultError> {
        let dir = self.partition_dir(domain, partition);
        let mut kids = Vec::new();
        for name in list_dir(&dir)? {
            if let Some(kid) = name.strip_suffix(PEM_SUFFIX) {
                kids.push(kid.to_string());
            }
        }
        Ok(kids)
    }

    fn delete_pem(&self, domain: &str, partition: Partition, kid: &str) -> Result<(), VaultError> {
        let path = self.pem_path(domain, partition, kid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::store("key delete", e)),
        }
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap().to_os_string();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

fn list_dir(dir: &Path) -> Result<Vec<String>, VaultError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VaultError::store("directory scan", e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| VaultError::store("directory scan", e))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

fn write_with_mode(path: &Path, contents: &str, partition: Partition) -> std::io::Result<()> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(partition.mode()))?;
    }
    #[cfg(not(unix))]
    let _ = partition;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("keys")).unwrap();
        (dir, store)
    }

    #[test]
    fn save_then_load_both_partitions() {
        let (_dir, store) = store();
        store
            .save_key_pair("USER", "USER-1", "pub-pem", "priv-pem")
            .unwrap();
        assert_eq!(store.load_public_key("USER", "USER-1").unwrap(), "pub-pem");
        assert_eq!(
            store.load_private_key("USER", "USER-1").unwrap().as_str(),
            "priv-pem"
        );
    }

    #[test]
    fn missing_key_is_distinguishable() {
        let (_dir, store) = store();
        let err = store.load_public_key("USER", "nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store
            .save_key_pair("USER", "USER-1", "pub", "priv")
            .unwrap();
        store.delete_private_key("USER", "USER-1").unwrap();
        store.delete_private_key("USER", "USER-1").unwrap();
        assert!(store.list_private_kids("USER").unwrap().is_empty());
        assert_eq!(store.list_public_kids("USER").unwrap(), vec!["USER-1"]);
    }

    #[test]
    fn tmp_residue_is_swept() {
        let (_dir, store) = store();
        store
            .save_key_pair("USER", "USER-1", "pub", "priv")
            .unwrap();
        let stray = store.partition_dir("USER", Partition::Public).join("x.pem.tmp");
        fs::write(&stray, "junk").unwrap();
        assert_eq!(store.clean_tmp_residue("USER").unwrap(), 1);
        assert!(!stray.exists());
        // Listing never surfaces temps.
        assert_eq!(store.list_public_kids("USER").unwrap(), vec!["USER-1"]);
    }

    #[cfg(unix)]
    #[test]
    fn private_keys_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, store) = store();
        store
            .save_key_pair("USER", "USER-1", "pub", "priv")
            .unwrap();
        let path = store.pem_path("USER", Partition::Private, "USER-1");
        let mode = fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}

use crate::registry::spec::{ServiceSpec, SPEC_FILE_EXT};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

/// The directory of persisted service specs, `<root>/sup/default/specs`.
#[derive(Clone, Debug)]
pub struct SpecDir {
    root: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecFileEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl SpecDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn under_sup_root(root: &Path) -> Self {
        Self::new(root.join("sup").join("default").join("specs"))
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, service_name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", service_name, SPEC_FILE_EXT))
    }

    /// Atomically write `spec`; the file is created owner-only on unix.
    pub fn write(&self, spec: &ServiceSpec) -> Result<PathBuf, crate::error::SupError> {
        let contents = spec.to_toml()?;
        let tmp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        let final_path = self.root.join(spec.file_name());

        fs::create_dir_all(&self.root)?;

        let written = write_synced(&tmp_path, contents.as_bytes())
            .and_then(|()| fs::rename(&tmp_path, &final_path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(final_path)
    }

    /// Every `*.spec` file, sorted by path. A missing directory is empty.
    pub fn list(&self) -> io::Result<Vec<SpecFileEntry>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut specs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(SPEC_FILE_EXT) {
                continue;
            }
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            specs.push(SpecFileEntry { path, modified });
        }
        specs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(specs)
    }

    /// Returns false when there was nothing to remove.
    pub fn remove(&self, service_name: &str) -> io::Result<bool> {
        match fs::remove_file(self.path_for(service_name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut f = create_private(path)?;
    f.write_all(contents)?;
    f.sync_all()
}

#[cfg(unix)]
fn create_private(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> io::Result<File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::spec::Topology;
    use tempfile::tempdir;

    fn spec(ident: &str) -> ServiceSpec {
        ServiceSpec::new(ident.parse().unwrap(), "default", Topology::Standalone).unwrap()
    }

    #[test]
    fn write_list_remove() {
        let dir = tempdir().unwrap();
        let specs = SpecDir::under_sup_root(dir.path());
        assert!(specs.list().unwrap().is_empty());

        let path = specs.write(&spec("klm/effortless")).unwrap();
        specs.write(&spec("core/redis")).unwrap();
        assert_eq!(path, specs.path_for("effortless"));

        let listed: Vec<_> = specs.list().unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(listed, vec![specs.path_for("effortless"), specs.path_for("redis")]);

        assert!(specs.remove("redis").unwrap());
        assert!(!specs.remove("redis").unwrap());
        assert_eq!(specs.list().unwrap().len(), 1);
    }

    #[test]
    fn failed_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let specs = SpecDir::under_sup_root(dir.path());
        // a non-empty directory where the spec should land makes the rename fail
        let target = specs.path_for("effortless");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("keep"), "x").unwrap();

        assert!(specs.write(&spec("klm/effortless")).is_err());
        let leftovers: Vec<_> = fs::read_dir(specs.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[cfg(unix)]
    #[test]
    fn written_spec_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let specs = SpecDir::under_sup_root(dir.path());
        let path = specs.write(&spec("klm/effortless")).unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn ignores_temp_and_foreign_files() {
        let dir = tempdir().unwrap();
        let specs = SpecDir::new(dir.path());
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join(".abc.tmp"), "x").unwrap();
        assert!(specs.list().unwrap().is_empty());
    }
}

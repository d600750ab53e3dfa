use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directory-backed blob target. Blob names are flat file names inside the
/// endpoint's root.
pub struct Endpoint {
    root: PathBuf,
}

impl Endpoint {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Endpoint> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Endpoint { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn put(&self, name: &str, data: &[u8]) -> io::Result<()> {
        fs::write(self.path(name), data)
    }

    pub fn get(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(name))
    }

    /// Stages the blob in `tmp` and then moves it into place, so a reader of
    /// this endpoint never observes a partially written object.
    pub fn ensure_put(&self, tmp: &Endpoint, name: &str, data: &[u8]) -> io::Result<()> {
        let staged = tmp.path(name);
        fs::write(&staged, data)?;

        let target = self.path(name);
        if fs::rename(&staged, &target).is_err() {
            // the staging directory may live on another filesystem
            fs::copy(&staged, &target)?;
            fs::remove_file(&staged)?;
        }
        Ok(())
    }
}

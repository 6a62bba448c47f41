use std::{
    fs,
    io::{BufWriter, Write},
    path::PathBuf,
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::ser::PrettyFormatter;
use tracing::{debug, error, info};

use crate::common::{Error, Result};

/// The data directory shared by the extraction jobs. Each dataset is one
/// `<name>.json` file, pretty-printed with four spaces, non-ASCII kept as is.
#[derive(Clone, Debug)]
pub struct DataStore {
    dir: PathBuf,
}

impl DataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    /// Writes the dataset, creating the data directory if needed. A failed
    /// write may leave a partial file behind.
    pub fn write<T: Serialize + ?Sized>(&self, name: &str, data: &T) -> Result<PathBuf> {
        let path = self.path_for(name);
        debug!("writing {}", path.display());

        let result = fs::create_dir_all(&self.dir)
            .and_then(|_| fs::File::create(&path))
            .map_err(Error::from)
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                let mut serializer = serde_json::Serializer::with_formatter(
                    &mut writer,
                    PrettyFormatter::with_indent(b"    "),
                );
                data.serialize(&mut serializer)?;
                writer.flush()?;
                Ok(())
            });

        match result {
            Ok(()) => {
                info!("saved {}", path.display());
                Ok(path)
            }
            Err(e) => {
                error!("failed to write {}: {}", path.display(), e);
                Err(e)
            }
        }
    }

    pub fn read<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.path_for(name);
        debug!("reading {}", path.display());
        let text = fs::read_to_string(&path).map_err(|e| {
            error!("failed to read {}: {}", path.display(), e);
            e
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Like [`DataStore::read`], but a missing file is `None` instead of an
    /// error.
    pub fn read_if_exists<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        if !self.exists(name) {
            return Ok(None);
        }
        self.read(name).map(Some)
    }
}

use std::path::Path;

use figment::{
    providers::{Data, Format, Json, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// A file-backed provider whose contents are read once, at load time.
pub struct FileProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl FileProvider {
    pub fn from_yaml<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        Self::from_file::<Yaml, _>(path, "YAML file")
    }

    pub fn from_json<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        Self::from_file::<Json, _>(path, "JSON file")
    }

    fn from_file<F, P>(path: P, name: &'static str) -> Result<Self, Error>
    where
        F: Format,
        P: AsRef<Path>,
    {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| e.to_string())?;
        let data = Data::<F>::string(&contents).data()?;

        Ok(Self {
            data,
            metadata: Metadata::from(name, path.as_ref()),
        })
    }
}

impl Provider for FileProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}

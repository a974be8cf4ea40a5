use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON persistence shared by the configuration file and the report state.
///
/// Writes go to a sibling `.tmp` file first and are renamed over the target,
/// so a crash mid-write never leaves a truncated document behind.
pub trait JsonStore: Sized {
    fn pretty_json(&self) -> Result<String>;
    fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()>;
    fn read_from<P: AsRef<Path>>(path: P) -> Result<Self>;
    /// Like `read_from`, but a missing file yields `Self::default()`.
    fn read_or_default<P: AsRef<Path>>(path: P) -> Result<Self>
    where
        Self: Default;
}

impl<T: Serialize + DeserializeOwned> JsonStore for T {
    fn pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serialize json")
    }

    fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let body = self.pretty_json()?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("write {}", Path::new(&tmp).display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    }

    fn read_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    fn read_or_default<P: AsRef<Path>>(path: P) -> Result<Self>
    where
        Self: Default,
    {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::read_from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn save_then_read_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sample.json");
        let s = Sample { name: "a".into(), count: 3 };
        s.save_to(&path).unwrap();
        assert_eq!(Sample::read_from(&path).unwrap(), s);
        assert!(!dir.path().join("nested").join("sample.json.tmp").exists());
    }

    #[test]
    fn missing_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let got = Sample::read_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(got, Sample::default());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Sample::read_or_default(&path).is_err());
    }
}

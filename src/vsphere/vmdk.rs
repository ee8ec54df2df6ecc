//! Datastore-qualified disk paths
//!
//! vSphere names disks as `[datastore] folder/disk.vmdk`. The populator
//! needs the datastore name (for VMFS introspection) and the host-side path
//! under `/vmfs/volumes` (as the clone source).

use crate::error::{Error, Result};

/// Parsed `[datastore] path/disk.vmdk`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmdkPath {
    raw: String,
    datastore: String,
    path: String,
}

impl VmdkPath {
    /// Parse and validate a datastore-qualified vmdk path
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidVmdkPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        let rest = trimmed
            .strip_prefix('[')
            .ok_or_else(|| invalid("must start with [datastore]"))?;
        let (datastore, path) = rest
            .split_once(']')
            .ok_or_else(|| invalid("missing closing bracket"))?;

        let datastore = datastore.trim();
        if datastore.is_empty() {
            return Err(invalid("empty datastore name"));
        }
        if !path.starts_with(' ') {
            return Err(invalid("expected a space after the datastore"));
        }

        let path = path.trim();
        if path.is_empty() {
            return Err(invalid("empty disk path"));
        }
        if path.starts_with('/') {
            return Err(invalid("disk path must be relative to the datastore"));
        }
        if !path.to_lowercase().ends_with(".vmdk") {
            return Err(invalid("disk path must end with .vmdk"));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            datastore: datastore.to_string(),
            path: path.to_string(),
        })
    }

    pub fn datastore(&self) -> &str {
        &self.datastore
    }

    /// Path relative to the datastore root
    pub fn relative_path(&self) -> &str {
        &self.path
    }

    /// Absolute path on an ESXi host
    pub fn host_path(&self) -> String {
        format!("/vmfs/volumes/{}/{}", self.datastore, self.path)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for VmdkPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_valid() {
        let p = VmdkPath::parse("[ds1] foo/bar.vmdk").unwrap();
        assert_eq!(p.datastore(), "ds1");
        assert_eq!(p.relative_path(), "foo/bar.vmdk");
        assert_eq!(p.host_path(), "/vmfs/volumes/ds1/foo/bar.vmdk");
    }

    #[test]
    fn test_parse_datastore_with_spaces() {
        let p = VmdkPath::parse("[Shared DS 01] vm one/vm one_1.vmdk").unwrap();
        assert_eq!(p.datastore(), "Shared DS 01");
        assert_eq!(p.relative_path(), "vm one/vm one_1.vmdk");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in [
            "ds1 foo/bar.vmdk",
            "[ds1 foo/bar.vmdk",
            "[] foo/bar.vmdk",
            "[ds1]foo/bar.vmdk",
            "[ds1] ",
            "[ds1] /abs/bar.vmdk",
            "[ds1] foo/bar.iso",
        ] {
            assert_matches!(
                VmdkPath::parse(raw),
                Err(Error::InvalidVmdkPath { .. }),
                "{raw} should be rejected"
            );
        }
    }
}

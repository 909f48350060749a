use std::process::Command;
use thiserror::Error;

/// What the external tagging interface hands back: an identifier to record
/// against the production, and whether the working tree was dirty when the
/// tag was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub tag: String,
    pub dirty: bool,
}

#[derive(Error, Debug)]
#[error("failed to resolve a provenance tag: {0}")]
pub struct ProvenanceError(pub String);

/// External version-control tagging boundary. The orchestrator only records
/// the returned identifier and cleanliness flag, it does not tag anything
/// itself.
pub trait ProvenanceTagger {
    fn tag(&self, name: &str, version: &str) -> Result<Provenance, ProvenanceError>;
}

/// Reads a tag out of `git describe` for the current working tree.
#[derive(Debug, Default)]
pub struct GitTagger;

fn parse_describe(described: &str) -> Provenance {
    let tag = described.trim().to_owned();
    let dirty = tag.ends_with("-dirty");

    Provenance { tag, dirty }
}

impl ProvenanceTagger for GitTagger {
    fn tag(&self, _name: &str, _version: &str) -> Result<Provenance, ProvenanceError> {
        let output = Command::new("git")
            .args(["describe", "--tags", "--always", "--dirty"])
            .output()
            .map_err(|error| ProvenanceError(format!("failed to invoke git: {error}")))?;

        if !output.status.success() {
            return Err(ProvenanceError(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }

        Ok(parse_describe(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::parse_describe;

    #[test]
    fn dirty_suffix_sets_the_flag() {
        let clean = parse_describe("v1.0-3-gabc123\n");
        assert_eq!(clean.tag, "v1.0-3-gabc123");
        assert!(!clean.dirty);

        let dirty = parse_describe("v1.0-3-gabc123-dirty\n");
        assert!(dirty.dirty);
    }
}

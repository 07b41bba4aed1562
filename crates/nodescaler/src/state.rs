//! Saved state of node groups.
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::GroupContext;
use crate::nodegroup::{NodeGroup, NodeGroupSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SavedState {
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub groups: Vec<NodeGroupSnapshot>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SavedState {
    pub fn capture<'a>(groups: impl IntoIterator<Item = &'a NodeGroup>) -> Self {
        Self {
            saved_at: Utc::now(),
            groups: groups.into_iter().map(NodeGroup::snapshot).collect(),
            extra: Default::default(),
        }
    }

    /// Writes the state as pretty JSON. The file is replaced atomically.
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(directory)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.persist(path).map_err(|error| error.error)?;
        log::debug!("Saved state of {} node group(s) to {}", self.groups.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Rebuilds every saved group on top of `ctx`.
    pub fn restore(self, ctx: &GroupContext) -> crate::Result<Vec<NodeGroup>> {
        self.groups
            .into_iter()
            .map(|snapshot| NodeGroup::restore(snapshot, ctx.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::SavedState;
    use crate::nodegroup::GroupStatus;
    use crate::tests::{GroupBuilder, TestEnv};

    #[tokio::test]
    async fn save_and_restore_groups() {
        let env = TestEnv::new();
        let group = GroupBuilder::default().min_size(2).create(&env).await;
        let other = GroupBuilder::default().id("batch".to_string()).build(&env);

        let directory = tempfile::TempDir::new().unwrap();
        let path = directory.path().join("state.json");
        SavedState::capture([&group, &other]).save(&path).unwrap();

        let groups = SavedState::load(&path).unwrap().restore(&env.ctx).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id(), "ng");
        assert_eq!(groups[0].target_size(), 2);
        assert_eq!(groups[0].ledger(), group.ledger());
        assert_eq!(groups[1].status(), GroupStatus::NotCreated);
    }

    #[test]
    fn unknown_fields_survive_save() {
        let directory = tempfile::TempDir::new().unwrap();
        let path = directory.path().join("state.json");
        std::fs::write(
            &path,
            r#"{
                "saved-at": "2024-05-01T10:00:00Z",
                "format": 3,
                "groups": [{
                    "spec": {"id": "ng", "min-size": 0, "max-size": 3},
                    "status": "created",
                    "nodes": [],
                    "ledger": {"slots": [{"index": 1, "state": "deleted"}], "high-water-mark": 1},
                    "counts": {"control-planes": 0, "external": 0, "autoscaled": 0, "managed": 0},
                    "zone": "eu-west-1a"
                }]
            }"#,
        )
        .unwrap();

        let state = SavedState::load(&path).unwrap();
        state.save(&path).unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["format"], 3);
        assert_eq!(saved["groups"][0]["zone"], "eu-west-1a");
        assert_eq!(saved["groups"][0]["ledger"]["high-water-mark"], 1);
    }

    #[test]
    fn load_missing_file() {
        let directory = tempfile::TempDir::new().unwrap();
        let result = SavedState::load(&directory.path().join("missing.json"));
        assert!(matches!(result, Err(crate::Error::Io(_))));
    }
}

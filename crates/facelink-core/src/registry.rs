//! Identity registry: enrolled faces and greedy threshold matching.

use crate::types::{Embedding, FaceRect};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Two embeddings belong to the same person when their Euclidean distance
/// is strictly below this value.
pub const MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("identity {name:?} has a {found}-dim embedding, expected {expected}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
}

/// An enrolled identity and the state of its latest sighting.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub id: Uuid,
    pub name: String,
    /// Most recent face chip: the enrollment chip until the first match.
    pub crop: RgbImage,
    pub embedding: Embedding,
    pub rect: FaceRect,
    /// Set when the last `match_probes` call matched this record.
    pub matched: bool,
    /// Distance of the last match.
    pub distance: Option<f32>,
    pub enrolled_at: DateTime<Utc>,
}

/// An incoming face to match against the registry.
///
/// `embedding` is `None` when embedding the face failed; such a face never
/// matches.
#[derive(Debug, Clone)]
pub struct Probe {
    pub crop: RgbImage,
    pub rect: FaceRect,
    pub embedding: Option<Embedding>,
}

/// Serialized form of a `FaceRecord`. Crops and rectangles are transient.
#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    id: Uuid,
    name: String,
    embedding: Embedding,
    enrolled_at: DateTime<Utc>,
}

/// The set of enrolled identities, in enrollment order.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    records: Vec<FaceRecord>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[FaceRecord] {
        &self.records
    }

    /// Records matched by the last `match_probes` call, in registry order.
    pub fn matched(&self) -> impl Iterator<Item = &FaceRecord> {
        self.records.iter().filter(|r| r.matched)
    }

    /// Append a new identity.
    pub fn enroll(
        &mut self,
        name: impl Into<String>,
        crop: RgbImage,
        rect: FaceRect,
        embedding: Embedding,
    ) -> &FaceRecord {
        let record = FaceRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            crop,
            embedding,
            rect,
            matched: false,
            distance: None,
            enrolled_at: Utc::now(),
        };
        tracing::info!(id = %record.id, name = %record.name, "enrolled identity");

        self.records.push(record);
        let last = self.records.len() - 1;
        &self.records[last]
    }

    /// Forget which records the last `match_probes` call matched.
    pub fn clear_matches(&mut self) {
        for record in &mut self.records {
            record.matched = false;
        }
    }

    /// Greedy first-match assignment of `probes` to records.
    ///
    /// All `matched` flags are reset first. Then, in registry order, each
    /// record takes the first probe not yet taken whose distance is below
    /// [`MATCH_THRESHOLD`], and its crop, rectangle and distance are updated.
    /// Pairs whose embedding dimensions differ never match. Unmatched records
    /// keep their previous crop and rectangle.
    ///
    /// Returns the number of matched records.
    pub fn match_probes(&mut self, probes: &[Probe]) -> usize {
        self.clear_matches();

        let mut taken = vec![false; probes.len()];
        let mut matches = 0;

        for record in &mut self.records {
            let hit = probes.iter().enumerate().find_map(|(i, probe)| {
                if taken[i] {
                    return None;
                }
                let distance = probe.embedding.as_ref()?.euclidean_distance(&record.embedding)?;
                (distance < MATCH_THRESHOLD).then_some((i, distance))
            });

            if let Some((i, distance)) = hit {
                taken[i] = true;
                record.crop = probes[i].crop.clone();
                record.rect = probes[i].rect;
                record.distance = Some(distance);
                record.matched = true;
                matches += 1;
                tracing::debug!(name = %record.name, distance, "identity matched");
            }
        }

        matches
    }

    /// Write identities (id, name, embedding, enrollment time) as JSON.
    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        let stored: Vec<StoredIdentity> = self
            .records
            .iter()
            .map(|r| StoredIdentity {
                id: r.id,
                name: r.name.clone(),
                embedding: r.embedding.clone(),
                enrolled_at: r.enrolled_at,
            })
            .collect();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&stored)?)?;
        tracing::info!(path = %path.display(), identities = stored.len(), "registry saved");
        Ok(())
    }

    /// Read identities written by [`save`](Self::save). A missing file is an
    /// empty registry. Every embedding must have `dimension` values.
    pub fn load(path: &Path, dimension: usize) -> Result<Self, RegistryError> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let stored: Vec<StoredIdentity> = serde_json::from_slice(&std::fs::read(path)?)?;
        let records = stored
            .into_iter()
            .map(|s| {
                if s.embedding.len() != dimension {
                    return Err(RegistryError::DimensionMismatch {
                        name: s.name,
                        expected: dimension,
                        found: s.embedding.len(),
                    });
                }
                Ok(FaceRecord {
                    id: s.id,
                    name: s.name,
                    crop: RgbImage::new(0, 0),
                    embedding: s.embedding,
                    rect: FaceRect::default(),
                    matched: false,
                    distance: None,
                    enrolled_at: s.enrolled_at,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(path = %path.display(), identities = records.len(), "registry loaded");
        Ok(Self { records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn probe(values: Vec<f32>, rect: FaceRect) -> Probe {
        Probe {
            crop: RgbImage::new(150, 150),
            rect,
            embedding: Some(Embedding::new(values)),
        }
    }

    fn registry_with(entries: &[(&str, Vec<f32>)]) -> IdentityRegistry {
        let mut registry = IdentityRegistry::new();
        for (name, values) in entries {
            registry.enroll(*name, RgbImage::new(150, 150), FaceRect::default(), Embedding::new(values.clone()));
        }
        registry
    }

    #[rstest]
    #[case(0.6, false)]
    #[case(0.599999, true)]
    #[case(0.0, true)]
    #[case(0.75, false)]
    fn test_threshold_is_strict(#[case] offset: f32, #[case] expect_match: bool) {
        let mut registry = registry_with(&[("alice", vec![0.0, 0.0])]);
        let probes = [probe(vec![offset, 0.0], FaceRect::new(1, 2, 3, 4))];

        let matches = registry.match_probes(&probes);
        assert_eq!(matches, usize::from(expect_match));
        assert_eq!(registry.records()[0].matched, expect_match);
    }

    #[test]
    fn test_greedy_first_entry_wins() {
        let mut registry = registry_with(&[("first", vec![0.0]), ("second", vec![0.1])]);
        let probes = [probe(vec![0.05], FaceRect::new(0, 0, 9, 9))];

        assert_eq!(registry.match_probes(&probes), 1);
        assert!(registry.records()[0].matched);
        assert!(!registry.records()[1].matched);
    }

    #[test]
    fn test_first_probe_under_threshold_not_closest() {
        let mut registry = registry_with(&[("alice", vec![0.0])]);
        let probes = [
            probe(vec![0.5], FaceRect::new(0, 0, 1, 1)),
            probe(vec![0.01], FaceRect::new(5, 5, 6, 6)),
        ];

        registry.match_probes(&probes);
        let alice = &registry.records()[0];
        assert_eq!(alice.rect, FaceRect::new(0, 0, 1, 1));
        assert!((alice.distance.unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_match_updates_record() {
        let mut registry = registry_with(&[("alice", vec![1.0, 1.0])]);
        let mut p = probe(vec![1.0, 1.0], FaceRect::new(10, 20, 30, 40));
        p.crop = RgbImage::from_pixel(150, 150, image::Rgb([7, 7, 7]));

        registry.match_probes(&[p]);
        let alice = &registry.records()[0];
        assert_eq!(alice.rect, FaceRect::new(10, 20, 30, 40));
        assert_eq!(alice.crop.get_pixel(0, 0).0, [7, 7, 7]);
        assert_eq!(alice.distance, Some(0.0));
    }

    #[test]
    fn test_unmatched_keeps_state_but_flag_resets() {
        let mut registry = registry_with(&[("alice", vec![0.0])]);
        registry.match_probes(&[probe(vec![0.1], FaceRect::new(3, 3, 8, 8))]);
        assert!(registry.records()[0].matched);

        assert_eq!(registry.match_probes(&[probe(vec![5.0], FaceRect::new(0, 0, 1, 1))]), 0);
        let alice = &registry.records()[0];
        assert!(!alice.matched);
        assert_eq!(alice.rect, FaceRect::new(3, 3, 8, 8));
    }

    #[test]
    fn test_failed_probe_never_matches() {
        let mut registry = registry_with(&[("alice", vec![0.0])]);
        let failed = Probe {
            crop: RgbImage::new(150, 150),
            rect: FaceRect::default(),
            embedding: None,
        };
        assert_eq!(registry.match_probes(&[failed]), 0);
    }

    #[test]
    fn test_two_faces_two_identities() {
        let mut registry = registry_with(&[("alice", vec![0.0]), ("bob", vec![10.0])]);
        let probes = [
            probe(vec![10.1], FaceRect::new(100, 0, 150, 50)),
            probe(vec![0.2], FaceRect::new(0, 0, 50, 50)),
        ];
        assert_eq!(registry.match_probes(&probes), 2);
        let names: Vec<_> = registry.matched().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(registry.records()[1].rect, FaceRect::new(100, 0, 150, 50));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registry.json");

        let registry = registry_with(&[("alice", vec![0.5, 0.25]), ("bob", vec![1.0, 2.0])]);
        registry.save(&path).unwrap();

        let loaded = IdentityRegistry::load(&path, 2).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.records()[0].id, registry.records()[0].id);
        assert_eq!(loaded.records()[1].name, "bob");
        assert_eq!(loaded.records()[1].embedding.values, vec![1.0, 2.0]);
        assert_eq!(loaded.records()[0].crop.width(), 0);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = IdentityRegistry::load(&dir.path().join("none.json"), 128).unwrap();
        assert!(loaded.is_empty());
    }

    #[rstest]
    #[case("[]", 0)]
    #[case("[0.0]", 1)]
    #[case("[0.0, 1.0, 2.0]", 3)]
    fn test_load_rejects_wrong_dimension(#[case] values: &str, #[case] found: usize) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let json = format!(
            r#"[{{"id":"67e55044-10b1-426f-9247-bb680e5fe0c8","name":"x","embedding":{{"values":{values}}},"enrolled_at":"2024-01-01T00:00:00Z"}}]"#
        );
        std::fs::write(&path, json).unwrap();

        match IdentityRegistry::load(&path, 2) {
            Err(RegistryError::DimensionMismatch { expected, found: got, .. }) => {
                assert_eq!(expected, 2);
                assert_eq!(got, found);
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_dimension_mismatch_never_matches() {
        let mut registry = registry_with(&[("truncated", vec![0.0])]);
        let probes = [probe(vec![0.0, 5.0, 5.0], FaceRect::new(0, 0, 9, 9))];

        assert_eq!(registry.match_probes(&probes), 0);
        assert!(!registry.records()[0].matched);
        assert_eq!(registry.records()[0].distance, None);
    }
}

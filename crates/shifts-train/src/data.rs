//! MLSR dataset and batch loaders
//!
//! A dataset root holds one JSON-lines manifest per split:
//!
//! ```text
//! <root>/manifests/train.json
//! <root>/manifests/val.json
//! <root>/manifests/id_val.json
//! <root>/manifests/test.json
//! ```
//!
//! Each line is `{"audio_filepath": ..., "label": ..., "offset": ..., "duration": ...}`
//! (`speaker` is accepted for `label`). Relative audio paths resolve against the root.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use serde::Deserialize;
use shifts_audio::AudioAugmentor;
use shifts_ml::{Batch, BatchSource};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Splits read by [`MlsrDataset::open`], in label-encoding order
pub const SPLITS: [&str; 4] = ["train", "val", "id_val", "test"];

#[derive(Debug, Error)]
pub enum DataError {
    #[error("manifest for split '{split}' not found at {path}")]
    MissingManifest { split: String, path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: invalid manifest entry: {source}")]
    Manifest {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("split '{0}' has no utterances")]
    EmptySplit(String),

    #[error("unknown split '{0}'")]
    UnknownSplit(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLabel {
    Text(String),
    Number(i64),
}

impl RawLabel {
    fn into_string(self) -> String {
        match self {
            RawLabel::Text(s) => s,
            RawLabel::Number(n) => n.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ManifestEntry {
    audio_filepath: PathBuf,
    #[serde(alias = "speaker")]
    label: RawLabel,
    #[serde(default)]
    offset: f64,
    #[serde(default)]
    duration: Option<f64>,
}

/// One manifest line with its encoded label
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub audio_filepath: PathBuf,
    pub label: usize,
    pub offset: f64,
    pub duration: Option<f64>,
}

fn read_manifest(root: &Path, split: &str) -> Result<Vec<(ManifestEntry, String)>, DataError> {
    let path = root.join("manifests").join(format!("{}.json", split));
    if !path.is_file() {
        return Err(DataError::MissingManifest {
            split: split.to_string(),
            path,
        });
    }
    let content = std::fs::read_to_string(&path).map_err(|source| DataError::Io {
        path: path.clone(),
        source,
    })?;

    let mut entries = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut entry: ManifestEntry =
            serde_json::from_str(line).map_err(|source| DataError::Manifest {
                path: path.clone(),
                line: i + 1,
                source,
            })?;
        if entry.audio_filepath.is_relative() {
            entry.audio_filepath = root.join(&entry.audio_filepath);
        }
        let label = std::mem::replace(&mut entry.label, RawLabel::Number(0)).into_string();
        entries.push((entry, label));
    }
    Ok(entries)
}

// ============================================================================
// Dataset
// ============================================================================

/// Speaker-labelled utterances for every split
pub struct MlsrDataset {
    root_dir: PathBuf,
    sample_rate: u32,
    splits: BTreeMap<String, Vec<Utterance>>,
    /// Encoded label → speaker name
    speakers: Vec<String>,
}

impl MlsrDataset {
    /// Read every split manifest and encode speaker labels
    ///
    /// Train speakers take ids `0..n` in sorted order; speakers that only
    /// appear in later splits are appended after them.
    pub fn open(root_dir: &Path, sample_rate: u32) -> Result<Self, DataError> {
        let mut raw = Vec::with_capacity(SPLITS.len());
        for split in SPLITS {
            raw.push((split, read_manifest(root_dir, split)?));
        }

        let mut speakers: Vec<String> = Vec::new();
        let mut ids: BTreeMap<String, usize> = BTreeMap::new();
        for (_, entries) in &raw {
            let fresh: BTreeSet<&String> = entries
                .iter()
                .map(|(_, label)| label)
                .filter(|label| !ids.contains_key(*label))
                .collect();
            for label in fresh {
                ids.insert(label.clone(), speakers.len());
                speakers.push(label.clone());
            }
        }

        let mut splits = BTreeMap::new();
        for (split, entries) in raw {
            let utterances = entries
                .into_iter()
                .map(|(entry, label)| Utterance {
                    audio_filepath: entry.audio_filepath,
                    label: ids[&label],
                    offset: entry.offset,
                    duration: entry.duration,
                })
                .collect::<Vec<_>>();
            tracing::info!("Split {}: {} utterances", split, utterances.len());
            splits.insert(split.to_string(), utterances);
        }

        Ok(Self {
            root_dir: root_dir.to_path_buf(),
            sample_rate,
            splits,
            speakers,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// All known speakers, indexed by encoded label
    pub fn speakers(&self) -> &[String] {
        &self.speakers
    }

    /// Subset of `split` loaded as `kind`, optionally perturbed by `augmentor`
    pub fn get_subset(
        &self,
        split: &str,
        kind: LoaderKind,
        augmentor: Option<Arc<AudioAugmentor>>,
    ) -> Result<Subset, DataError> {
        let utterances = self
            .splits
            .get(split)
            .ok_or_else(|| DataError::UnknownSplit(split.to_string()))?;
        if utterances.is_empty() {
            return Err(DataError::EmptySplit(split.to_string()));
        }
        Ok(Subset {
            split: split.to_string(),
            utterances: utterances.clone(),
            kind,
            augmentor,
            sample_rate: self.sample_rate,
        })
    }
}

// ============================================================================
// Subsets
// ============================================================================

/// How each utterance is turned into training examples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    SingleView,
    /// `n_views` independently augmented copies of each utterance
    MultiView { n_views: usize },
}

impl LoaderKind {
    pub fn views(self) -> usize {
        match self {
            LoaderKind::SingleView => 1,
            LoaderKind::MultiView { n_views } => n_views.max(1),
        }
    }
}

pub struct Subset {
    split: String,
    utterances: Vec<Utterance>,
    kind: LoaderKind,
    augmentor: Option<Arc<AudioAugmentor>>,
    sample_rate: u32,
}

impl Subset {
    pub fn split(&self) -> &str {
        &self.split
    }

    pub fn kind(&self) -> LoaderKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn has_augmentor(&self) -> bool {
        self.augmentor.is_some()
    }

    /// Encoded labels, one per utterance
    pub fn y_array(&self) -> Vec<usize> {
        self.utterances.iter().map(|u| u.label).collect()
    }

    /// Number of distinct labels in this subset
    pub fn num_classes(&self) -> usize {
        self.utterances
            .iter()
            .map(|u| u.label)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Decode utterance `index` into its views
    pub fn load(&self, index: usize, rng: &mut dyn RngCore) -> Result<Vec<Vec<f32>>> {
        let utterance = self
            .utterances
            .get(index)
            .ok_or_else(|| anyhow!("Index {} out of range for split {}", index, self.split))?;
        let samples = shifts_audio::file_io::load_segment(
            &utterance.audio_filepath,
            self.sample_rate,
            utterance.offset,
            utterance.duration,
        )?;

        let mut views = Vec::with_capacity(self.kind.views());
        for _ in 0..self.kind.views() {
            let mut view = samples.clone();
            if let Some(augmentor) = &self.augmentor {
                augmentor.perturb(&mut view, self.sample_rate, rng)?;
            }
            views.push(view);
        }
        Ok(views)
    }

    fn label(&self, index: usize) -> usize {
        self.utterances[index].label
    }
}

// ============================================================================
// Loaders
// ============================================================================

/// Shuffled batches, reshuffled every epoch from `seed`
pub struct TrainLoader {
    subset: Arc<Subset>,
    batch_size: usize,
    seed: u64,
    /// Permutation of the most recent epoch
    permutation: Mutex<Option<(usize, Vec<usize>)>>,
}

pub fn get_train_loader(subset: Arc<Subset>, batch_size: usize, seed: u64) -> TrainLoader {
    TrainLoader {
        subset,
        batch_size: batch_size.max(1),
        seed,
        permutation: Mutex::new(None),
    }
}

impl TrainLoader {
    fn shuffle(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.subset.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);
        order
    }

    /// Utterance indices of batch `index`, shuffling at most once per epoch
    fn batch_indices(&self, epoch: usize, index: usize) -> Result<Vec<usize>> {
        let mut cached = self.permutation.lock();
        if !matches!(cached.as_ref(), Some((e, _)) if *e == epoch) {
            *cached = Some((epoch, self.shuffle(epoch)));
        }
        let order: &[usize] = cached.as_ref().map_or(&[], |(_, order)| order.as_slice());

        let start = index * self.batch_size;
        if start >= order.len() {
            anyhow::bail!("Batch {} out of range for split {}", index, self.subset.split());
        }
        let end = (start + self.batch_size).min(order.len());
        Ok(order[start..end].to_vec())
    }

    #[cfg(test)]
    fn cached_epoch(&self) -> Option<usize> {
        self.permutation.lock().as_ref().map(|(epoch, _)| *epoch)
    }
}

impl BatchSource for TrainLoader {
    fn num_batches(&self) -> usize {
        self.subset.len().div_ceil(self.batch_size)
    }

    fn batch(&self, epoch: usize, index: usize) -> Result<Batch> {
        let indices = self.batch_indices(epoch, index)?;

        let mut rng = StdRng::seed_from_u64(
            self.seed
                .wrapping_mul(31)
                .wrapping_add((epoch as u64) << 32)
                .wrapping_add(index as u64),
        );
        let mut batch = Batch::default();
        for &i in &indices {
            for view in self.subset.load(i, &mut rng)? {
                batch.audio.push(view);
                batch.labels.push(self.subset.label(i));
            }
        }
        Ok(batch)
    }
}

/// Deterministic batches decoded across `num_workers` scoped threads
pub struct EvalLoader {
    subset: Arc<Subset>,
    batch_size: usize,
    num_workers: usize,
}

pub fn get_eval_loader(subset: Arc<Subset>, batch_size: usize, num_workers: usize) -> EvalLoader {
    EvalLoader {
        subset,
        batch_size: batch_size.max(1),
        num_workers,
    }
}

impl EvalLoader {
    fn load_range(subset: &Subset, indices: &[usize]) -> Result<Vec<(Vec<f32>, usize)>> {
        let mut rng = StdRng::seed_from_u64(0);
        let mut items = Vec::with_capacity(indices.len());
        for &i in indices {
            for view in subset.load(i, &mut rng)? {
                items.push((view, subset.label(i)));
            }
        }
        Ok(items)
    }
}

impl BatchSource for EvalLoader {
    fn num_batches(&self) -> usize {
        self.subset.len().div_ceil(self.batch_size)
    }

    fn batch(&self, _epoch: usize, index: usize) -> Result<Batch> {
        let start = index * self.batch_size;
        if start >= self.subset.len() {
            anyhow::bail!("Batch {} out of range for split {}", index, self.subset.split());
        }
        let end = (start + self.batch_size).min(self.subset.len());
        let indices: Vec<usize> = (start..end).collect();

        let items = if self.num_workers <= 1 || indices.len() < 2 {
            Self::load_range(&self.subset, &indices)?
        } else {
            let chunk = indices.len().div_ceil(self.num_workers);
            let subset = self.subset.as_ref();
            std::thread::scope(|scope| {
                let handles: Vec<_> = indices
                    .chunks(chunk)
                    .map(|part| scope.spawn(move || Self::load_range(subset, part)))
                    .collect();
                let mut items = Vec::with_capacity(indices.len());
                for handle in handles {
                    let part = handle
                        .join()
                        .map_err(|_| anyhow!("Eval loader worker panicked"))??;
                    items.extend(part);
                }
                Ok::<_, anyhow::Error>(items)
            })
            .with_context(|| format!("Failed to load {} batch {}", self.subset.split(), index))?
        };

        let (audio, labels) = items.into_iter().unzip();
        Ok(Batch { audio, labels })
    }
}

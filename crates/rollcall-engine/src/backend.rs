//! Matching backends.
//!
//! A backend owns enrolled samples and answers "who is this patch closest
//! to?". `LocalBackend` keeps samples in the SQLite identity store and
//! matches with an in-process LBPH model; `RemoteBackend` hands both jobs to
//! a caller-supplied face collection.

use crate::store::{IdentityStore, StoreError};
use parking_lot::{Mutex, RwLock};
use rollcall_core::{Label, LabelMap, LbphModel, LbphParams, ModelError, NewSample, Patch, SamplingPolicy};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("remote collection: {0}")]
    Remote(String),
}

/// Outcome of an enrollment call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentResult {
    pub person_id: String,
    /// `None` when the backend has no integer labels.
    pub label: Option<Label>,
    pub samples_added: usize,
}

/// Nearest enrolled person for a probe, before thresholding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub person_id: String,
    pub label: Option<Label>,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonSummary {
    pub person_id: String,
    pub label: Option<Label>,
    pub samples: usize,
}

pub trait MatchingBackend: Send + Sync {
    fn enroll(&self, person_id: &str, samples: Vec<NewSample>) -> Result<EnrollmentResult, BackendError>;

    /// Nearest enrolled person, or `None` if the backend found nobody.
    fn identify(&self, probe: &Patch) -> Result<Option<Candidate>, BackendError>;

    /// Returns `false` if the person was not enrolled.
    fn remove(&self, person_id: &str) -> Result<bool, BackendError>;

    fn persons(&self) -> Result<Vec<PersonSummary>, BackendError>;

    /// How many times a model has been trained. Zero for backends without one.
    fn retrain_count(&self) -> u64 {
        0
    }
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

/// A model plus the LabelMap and generation it was built from.
#[derive(Debug)]
pub struct TrainedModel {
    pub generation: u64,
    pub labels: LabelMap,
    pub model: LbphModel,
}

/// Generation-keyed model slot with single-flight rebuild.
pub struct ModelCache {
    params: LbphParams,
    slot: RwLock<Option<Arc<TrainedModel>>>,
    rebuild: Mutex<()>,
    retrains: AtomicU64,
}

impl ModelCache {
    pub fn new(params: LbphParams) -> Self {
        Self {
            params,
            slot: RwLock::new(None),
            rebuild: Mutex::new(()),
            retrains: AtomicU64::new(0),
        }
    }

    pub fn retrain_count(&self) -> u64 {
        self.retrains.load(Ordering::Relaxed)
    }

    /// Model matching the store's current generation, rebuilding if stale.
    pub fn current(&self, store: &IdentityStore) -> Result<Arc<TrainedModel>, BackendError> {
        if let Some(model) = self.fresh(store.generation()) {
            return Ok(model);
        }

        let _gate = self.rebuild.lock();
        // Whoever held the gate before us may have rebuilt already.
        if let Some(model) = self.fresh(store.generation()) {
            return Ok(model);
        }

        let model = Arc::new(self.build(store)?);
        *self.slot.write() = Some(Arc::clone(&model));
        Ok(model)
    }

    fn fresh(&self, generation: u64) -> Option<Arc<TrainedModel>> {
        self.slot
            .read()
            .as_ref()
            .filter(|m| m.generation == generation)
            .map(Arc::clone)
    }

    fn build(&self, store: &IdentityStore) -> Result<TrainedModel, BackendError> {
        if let Some(model) = self.load_persisted(store)? {
            return Ok(model);
        }

        let snapshot = store.snapshot()?;
        let model = LbphModel::train(
            self.params,
            snapshot.samples.iter().map(|s| (s.label, &s.patch)),
        )?;
        self.retrains.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = store.save_model(snapshot.generation, &model.to_blob()) {
            tracing::warn!(error = %e, generation = snapshot.generation, "failed to persist model");
        }

        Ok(TrainedModel {
            generation: snapshot.generation,
            labels: snapshot.labels,
            model,
        })
    }

    /// The stored blob, if it was trained at the current generation with the
    /// current parameters and decodes cleanly.
    fn load_persisted(&self, store: &IdentityStore) -> Result<Option<TrainedModel>, BackendError> {
        let generation = store.generation();
        let Some(stored) = store.load_model()? else {
            return Ok(None);
        };
        if stored.generation != generation {
            tracing::debug!(stored = stored.generation, current = generation, "stored model is stale");
            return Ok(None);
        }

        let model = match LbphModel::from_blob(&stored.blob) {
            Ok(model) => model,
            Err(e) => {
                tracing::warn!(error = %e, generation, "stored model unreadable, retraining");
                return Ok(None);
            }
        };
        if model.params() != self.params {
            tracing::debug!("stored model parameters differ, retraining");
            return Ok(None);
        }

        let labels = store.label_map()?;
        if store.generation() != generation {
            return Ok(None);
        }

        tracing::info!(generation, samples = model.len(), "loaded persisted model");
        Ok(Some(TrainedModel {
            generation,
            labels,
            model,
        }))
    }
}

pub struct LocalBackend {
    store: Arc<IdentityStore>,
    cache: ModelCache,
    sampling: SamplingPolicy,
}

impl LocalBackend {
    pub fn new(store: Arc<IdentityStore>, params: LbphParams, sampling: SamplingPolicy) -> Self {
        Self {
            store,
            cache: ModelCache::new(params),
            sampling,
        }
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }
}

impl MatchingBackend for LocalBackend {
    /// Label lookup or minting and the sample append commit together, so a
    /// concurrent `remove` cannot strand the label between the two.
    fn enroll(&self, person_id: &str, samples: Vec<NewSample>) -> Result<EnrollmentResult, BackendError> {
        let (label, samples_added) = self.store.enroll(person_id, &samples, &self.sampling)?;
        Ok(EnrollmentResult {
            person_id: person_id.to_string(),
            label: Some(label),
            samples_added,
        })
    }

    fn identify(&self, probe: &Patch) -> Result<Option<Candidate>, BackendError> {
        let trained = self.cache.current(&self.store)?;
        let prediction = trained.model.predict(probe)?;
        let person_id = trained.labels.person(prediction.label).ok_or_else(|| {
            StoreError::Corrupt(format!("model label {} has no person", prediction.label))
        })?;
        tracing::debug!(
            person_id,
            label = prediction.label,
            distance = prediction.distance,
            generation = trained.generation,
            "nearest sample"
        );
        Ok(Some(Candidate {
            person_id: person_id.to_string(),
            label: Some(prediction.label),
            distance: prediction.distance,
        }))
    }

    fn remove(&self, person_id: &str) -> Result<bool, BackendError> {
        Ok(self.store.remove_person(person_id)?.is_some())
    }

    fn persons(&self) -> Result<Vec<PersonSummary>, BackendError> {
        Ok(self
            .store
            .persons()?
            .into_iter()
            .map(|p| PersonSummary {
                person_id: p.person_id,
                label: Some(p.label),
                samples: p.samples,
            })
            .collect())
    }

    fn retrain_count(&self) -> u64 {
        self.cache.retrain_count()
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// Best match reported by a remote collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMatch {
    pub person_id: String,
    pub distance: f32,
}

/// A face collection hosted elsewhere, keyed by person id. Implementations
/// own their transport; failures come back as `BackendError::Remote`.
pub trait RemoteCollection: Send + Sync {
    /// Index patches under `person_id`. Returns how many were accepted.
    fn index_faces(&self, person_id: &str, patches: &[Patch]) -> Result<usize, BackendError>;

    fn search_faces(&self, probe: &Patch) -> Result<Option<RemoteMatch>, BackendError>;

    fn delete_person(&self, person_id: &str) -> Result<bool, BackendError>;

    /// Person ids with their indexed face counts.
    fn list_persons(&self) -> Result<Vec<(String, usize)>, BackendError>;
}

pub struct RemoteBackend {
    collection: Box<dyn RemoteCollection>,
    sampling: SamplingPolicy,
}

impl RemoteBackend {
    pub fn new(collection: Box<dyn RemoteCollection>, sampling: SamplingPolicy) -> Self {
        Self {
            collection,
            sampling,
        }
    }
}

impl MatchingBackend for RemoteBackend {
    fn enroll(&self, person_id: &str, samples: Vec<NewSample>) -> Result<EnrollmentResult, BackendError> {
        let patches: Vec<Patch> = self
            .sampling
            .select(samples)
            .into_iter()
            .map(|s| s.patch)
            .collect();
        let samples_added = self.collection.index_faces(person_id, &patches)?;
        tracing::info!(person_id, offered = patches.len(), indexed = samples_added, "indexed remotely");
        Ok(EnrollmentResult {
            person_id: person_id.to_string(),
            label: None,
            samples_added,
        })
    }

    fn identify(&self, probe: &Patch) -> Result<Option<Candidate>, BackendError> {
        Ok(self.collection.search_faces(probe)?.map(|m| Candidate {
            person_id: m.person_id,
            label: None,
            distance: m.distance,
        }))
    }

    fn remove(&self, person_id: &str) -> Result<bool, BackendError> {
        self.collection.delete_person(person_id)
    }

    fn persons(&self) -> Result<Vec<PersonSummary>, BackendError> {
        Ok(self
            .collection
            .list_persons()?
            .into_iter()
            .map(|(person_id, samples)| PersonSummary {
                person_id,
                label: None,
                samples,
            })
            .collect())
    }
}

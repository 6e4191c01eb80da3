use crate::attendance::{AttendanceEntry, AttendanceLog};
use crate::backend::{
    BackendError, EnrollmentResult, LocalBackend, MatchingBackend, PersonSummary, RemoteBackend,
    RemoteCollection,
};
use crate::config::{BackendKind, Config, ConfigError};
use crate::store::{IdentityStore, StoreError};
use chrono::{Local, NaiveDate};
use rollcall_core::{
    CascadeError, FaceLocator, Frame, Label, ModelError, NewSample, NormalizeError, SampleNormalizer,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no face detected in any enrollment frame")]
    NoFaceDetected,
    #[error("normalizer error: {0}")]
    InvalidRegion(#[from] NormalizeError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("backend error: {0}")]
    Backend(BackendError),
    #[error("cascade error: {0}")]
    Cascade(#[from] CascadeError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("remote backend selected but no remote collection supplied")]
    MissingRemote,
}

impl From<BackendError> for EngineError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Store(e) => EngineError::Store(e),
            BackendError::Model(e) => EngineError::Model(e),
            other => EngineError::Backend(other),
        }
    }
}

/// Outcome of a recognition call. `NoFace` and `Unknown` are ordinary
/// results, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecognitionResult {
    NoFace,
    Match {
        person_id: String,
        label: Option<Label>,
        distance: f32,
        /// `1 - distance / threshold`, clamped to `[0, 1]`.
        confidence: f32,
    },
    Unknown {
        /// `None` when the backend found no candidate at all.
        distance: Option<f32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckIn {
    pub result: RecognitionResult,
    /// `true` only for the person's first check-in of the day.
    pub recorded: bool,
}

/// Enrollment and recognition over one locator, normalizer and backend.
///
/// All methods take `&self`; the engine can be shared across threads.
pub struct RecognitionEngine {
    locator: FaceLocator,
    normalizer: SampleNormalizer,
    backend: Box<dyn MatchingBackend>,
    threshold: f32,
    attendance: Option<AttendanceLog>,
}

impl RecognitionEngine {
    /// Build an engine from configuration. `remote` is required when the
    /// configured backend is `remote` and ignored otherwise.
    ///
    /// A local store that already holds samples fixes the patch size; a
    /// config with a different `canonical_size` is refused.
    pub fn open(config: &Config, remote: Option<Box<dyn RemoteCollection>>) -> Result<Self, EngineError> {
        config.validate()?;
        let locator = FaceLocator::from_cascades(
            &config.frontal_cascade,
            &config.profile_cascade,
            config.detect_params(),
        )?;

        let backend: Box<dyn MatchingBackend> = match config.backend {
            BackendKind::Local => {
                let store = Arc::new(IdentityStore::open(&config.db_path)?);
                if let Some(stored) = store.patch_size()? {
                    if stored != config.canonical_size {
                        return Err(StoreError::PatchSizeMismatch {
                            expected: stored,
                            actual: config.canonical_size,
                        }
                        .into());
                    }
                }
                Box::new(LocalBackend::new(store, config.lbph_params(), config.sampling()))
            }
            BackendKind::Remote => {
                let collection = remote.ok_or(EngineError::MissingRemote)?;
                if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
                }
                Box::new(RemoteBackend::new(collection, config.sampling()))
            }
        };
        let attendance = AttendanceLog::open(&config.db_path)?;

        tracing::info!(
            backend = ?config.backend,
            threshold = config.acceptance_threshold,
            canonical_size = config.canonical_size,
            "recognition engine ready"
        );

        Ok(Self::with_parts(
            locator,
            SampleNormalizer::new(config.canonical_size),
            backend,
            config.acceptance_threshold,
        )
        .with_attendance(attendance))
    }

    pub fn with_parts(
        locator: FaceLocator,
        normalizer: SampleNormalizer,
        backend: Box<dyn MatchingBackend>,
        threshold: f32,
    ) -> Self {
        Self {
            locator,
            normalizer,
            backend,
            threshold,
            attendance: None,
        }
    }

    pub fn with_attendance(mut self, log: AttendanceLog) -> Self {
        self.attendance = Some(log);
        self
    }

    /// Enroll `person_id` from a burst of frames.
    ///
    /// Each frame contributes at most one sample, from its first located
    /// region; frames without a face are skipped. The backend's sampling
    /// policy then thins the accepted frames. Enrolling an existing person
    /// appends to their samples.
    pub fn enroll(&self, person_id: &str, frames: &[Frame]) -> Result<EnrollmentResult, EngineError> {
        let mut samples = Vec::with_capacity(frames.len());
        for (i, frame) in frames.iter().enumerate() {
            let Some(region) = self.locator.locate(frame).into_iter().next() else {
                tracing::debug!(frame = i, "no face in enrollment frame");
                continue;
            };
            let patch = self.normalizer.normalize(frame, &region)?;
            samples.push(NewSample {
                view: region.view,
                patch,
            });
        }

        if samples.is_empty() {
            return Err(EngineError::NoFaceDetected);
        }

        let accepted = samples.len();
        let result = self.backend.enroll(person_id, samples)?;
        tracing::info!(
            person_id,
            label = ?result.label,
            frames = frames.len(),
            accepted,
            stored = result.samples_added,
            "person enrolled"
        );
        Ok(result)
    }

    /// Identify the first face in `frame`.
    pub fn recognize(&self, frame: &Frame) -> Result<RecognitionResult, EngineError> {
        let regions = self.locator.locate(frame);
        let Some(region) = regions.first() else {
            tracing::debug!("no face in probe frame");
            return Ok(RecognitionResult::NoFace);
        };
        tracing::debug!(regions = regions.len(), view = %region.view, "probe region selected");

        let probe = self.normalizer.normalize(frame, region)?;
        let Some(candidate) = self.backend.identify(&probe)? else {
            return Ok(RecognitionResult::Unknown { distance: None });
        };

        if candidate.distance <= self.threshold {
            let confidence = if self.threshold > 0.0 {
                (1.0 - candidate.distance / self.threshold).clamp(0.0, 1.0)
            } else {
                1.0
            };
            tracing::info!(
                person_id = %candidate.person_id,
                distance = candidate.distance,
                confidence,
                "face recognized"
            );
            Ok(RecognitionResult::Match {
                person_id: candidate.person_id,
                label: candidate.label,
                distance: candidate.distance,
                confidence,
            })
        } else {
            tracing::info!(
                nearest = %candidate.person_id,
                distance = candidate.distance,
                threshold = self.threshold,
                "face not recognized"
            );
            Ok(RecognitionResult::Unknown {
                distance: Some(candidate.distance),
            })
        }
    }

    /// Recognize and, on a match, record today's attendance.
    pub fn check_in(&self, frame: &Frame) -> Result<CheckIn, EngineError> {
        let result = self.recognize(frame)?;
        let recorded = match (&result, &self.attendance) {
            (RecognitionResult::Match { person_id, .. }, Some(log)) => log.record(person_id, Local::now())?,
            _ => false,
        };
        Ok(CheckIn { result, recorded })
    }

    /// Attendance for `day`. Empty when the engine has no attendance log.
    pub fn attendance_on(&self, day: NaiveDate) -> Result<Vec<AttendanceEntry>, EngineError> {
        match &self.attendance {
            Some(log) => Ok(log.on(day)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn remove(&self, person_id: &str) -> Result<bool, EngineError> {
        let removed = self.backend.remove(person_id)?;
        if !removed {
            tracing::debug!(person_id, "remove: not enrolled");
        }
        Ok(removed)
    }

    pub fn persons(&self) -> Result<Vec<PersonSummary>, EngineError> {
        Ok(self.backend.persons()?)
    }

    pub fn retrain_count(&self) -> u64 {
        self.backend.retrain_count()
    }
}

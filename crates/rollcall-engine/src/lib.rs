//! rollcall-engine — enrollment and recognition on top of rollcall-core.
//!
//! Owns everything with state: the SQLite identity store (persons, labels,
//! samples, the serialized model), the generation-keyed model cache, the
//! matching backends and the attendance log. [`RecognitionEngine`] ties them
//! to a face locator and normalizer and exposes `enroll` / `recognize`.

pub mod attendance;
pub mod backend;
pub mod config;
pub mod engine;
pub mod store;

pub use attendance::{AttendanceEntry, AttendanceLog};
pub use backend::{
    BackendError, Candidate, EnrollmentResult, LocalBackend, MatchingBackend, ModelCache,
    PersonSummary, RemoteBackend, RemoteCollection, RemoteMatch, TrainedModel,
};
pub use config::{BackendKind, Config, ConfigError};
pub use engine::{CheckIn, EngineError, RecognitionEngine, RecognitionResult};
pub use store::{IdentityStore, PersonRecord, Snapshot, StoreError, StoredModel};

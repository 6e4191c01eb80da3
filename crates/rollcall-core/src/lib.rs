//! rollcall-core — Face location, patch normalization and recognition.
//!
//! Haar cascades locate frontal and profile faces, located regions are
//! normalized into canonical grayscale patches, and an LBPH model matches
//! probe patches against enrolled ones. Everything here is pure CPU code
//! with no storage or threading concerns.

pub mod cascade;
pub mod lbph;
pub mod locator;
pub mod normalizer;
pub mod types;

pub use cascade::{CascadeDetector, CascadeError, DetectParams, HaarCascade};
pub use lbph::{LbphModel, LbphParams, ModelBlob, ModelError, Prediction};
pub use locator::{FaceLocator, RegionDetector};
pub use normalizer::{NormalizeError, SampleNormalizer, CANONICAL_SIZE};
pub use types::{
    Frame, FrameError, Label, LabelMap, NewSample, Patch, Rect, Region, Sample, SamplingPolicy, View,
};

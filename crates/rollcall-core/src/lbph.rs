//! Local Binary Pattern Histogram (LBPH) face recognizer.
//!
//! Each patch is encoded as a grid of per-cell LBP code histograms. A probe
//! is matched against every stored histogram with a symmetric chi-square
//! distance; the nearest sample's label wins.

use crate::types::{Label, Patch};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// --- Named constants ---
const LBP_BINS: usize = 256;
const CHI_SQUARE_EPS: f32 = f32::EPSILON;
const MODEL_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("cannot train on an empty sample set; enroll someone first")]
    EmptyTrainingSet,
    #[error("patch size {actual} does not match model patch size {expected}")]
    PatchSizeMismatch { expected: u32, actual: u32 },
    #[error("invalid LBPH parameters: {0}")]
    InvalidParams(String),
    #[error("serialized model is corrupt: {0}")]
    LoadCorrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    fn histogram_len(&self) -> usize {
        self.grid_x as usize * self.grid_y as usize * LBP_BINS
    }

    /// Check that a `patch_size` square patch yields non-empty grid cells.
    fn check(&self, patch_size: u32) -> Result<(), ModelError> {
        if self.radius == 0 || self.grid_x == 0 || self.grid_y == 0 {
            return Err(ModelError::InvalidParams(format!("{self:?}")));
        }
        let inner = patch_size.saturating_sub(2 * self.radius);
        if inner / self.grid_x == 0 || inner / self.grid_y == 0 {
            return Err(ModelError::InvalidParams(format!(
                "{patch_size}px patch too small for radius {} and {}x{} grid",
                self.radius, self.grid_x, self.grid_y
            )));
        }
        Ok(())
    }
}

/// Nearest stored sample for a probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: Label,
    /// Chi-square distance, lower is more similar. Non-negative, unbounded.
    pub distance: f32,
    /// Row of the matching sample in training order.
    pub sample_index: usize,
}

/// Trained LBPH model. Immutable once built.
#[derive(Debug, Clone)]
pub struct LbphModel {
    params: LbphParams,
    patch_size: u32,
    labels: Vec<Label>,
    /// One spatial histogram per training sample, in training order.
    histograms: Array2<f32>,
}

impl LbphModel {
    /// Train on `(label, patch)` pairs.
    ///
    /// Ties in `predict` resolve to the earliest row, so callers wanting
    /// lowest-label-then-earliest-sample ordering must pass samples sorted
    /// that way.
    pub fn train<'a, I>(params: LbphParams, samples: I) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = (Label, &'a Patch)>,
    {
        let mut samples = samples.into_iter().peekable();
        let patch_size = samples.peek().ok_or(ModelError::EmptyTrainingSet)?.1.size;
        params.check(patch_size)?;

        let bins = params.histogram_len();
        let mut labels = Vec::new();
        let mut flat = Vec::new();
        for (label, patch) in samples {
            if patch.size != patch_size {
                return Err(ModelError::PatchSizeMismatch {
                    expected: patch_size,
                    actual: patch.size,
                });
            }
            labels.push(label);
            flat.extend(spatial_histogram(patch, &params));
        }

        let histograms = Array2::from_shape_vec((labels.len(), bins), flat)
            .map_err(|e| ModelError::InvalidParams(format!("histogram shape: {e}")))?;

        tracing::info!(
            samples = labels.len(),
            patch_size,
            radius = params.radius,
            grid_x = params.grid_x,
            grid_y = params.grid_y,
            "trained LBPH model"
        );

        Ok(Self {
            params,
            patch_size,
            labels,
            histograms,
        })
    }

    pub fn params(&self) -> LbphParams {
        self.params
    }

    pub fn patch_size(&self) -> u32 {
        self.patch_size
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Find the nearest stored sample.
    pub fn predict(&self, patch: &Patch) -> Result<Prediction, ModelError> {
        if patch.size != self.patch_size {
            return Err(ModelError::PatchSizeMismatch {
                expected: self.patch_size,
                actual: patch.size,
            });
        }
        let probe = spatial_histogram(patch, &self.params);
        let probe = ArrayView1::from(probe.as_slice());

        let mut best: Option<Prediction> = None;
        for (i, row) in self.histograms.outer_iter().enumerate() {
            let distance = chi_square(row, probe.view());
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction {
                    label: self.labels[i],
                    distance,
                    sample_index: i,
                });
            }
        }

        best.ok_or(ModelError::EmptyTrainingSet)
    }

    /// Serialize into a self-checking blob.
    pub fn to_blob(&self) -> ModelBlob {
        let header = ModelHeader {
            format_version: MODEL_FORMAT_VERSION,
            params: self.params,
            patch_size: self.patch_size,
            labels: self.labels.clone(),
        };
        // Serializing a plain struct of numbers cannot fail.
        let header = serde_json::to_string(&header).unwrap_or_default();
        let histograms: Vec<u8> = self.histograms.iter().flat_map(|v| v.to_le_bytes()).collect();
        let digest = blob_digest(&header, &histograms);
        ModelBlob {
            header,
            histograms,
            digest,
        }
    }

    /// Rebuild a model from a blob, verifying digest, version and shape.
    pub fn from_blob(blob: &ModelBlob) -> Result<Self, ModelError> {
        if blob_digest(&blob.header, &blob.histograms) != blob.digest {
            return Err(ModelError::LoadCorrupt("digest mismatch".into()));
        }
        let header: ModelHeader = serde_json::from_str(&blob.header)
            .map_err(|e| ModelError::LoadCorrupt(format!("header: {e}")))?;
        if header.format_version != MODEL_FORMAT_VERSION {
            return Err(ModelError::LoadCorrupt(format!(
                "unsupported format version {}",
                header.format_version
            )));
        }
        if header.labels.is_empty() {
            return Err(ModelError::LoadCorrupt("model has no samples".into()));
        }
        header
            .params
            .check(header.patch_size)
            .map_err(|e| ModelError::LoadCorrupt(e.to_string()))?;

        let bins = header.params.histogram_len();
        let expected = header.labels.len() * bins * 4;
        if blob.histograms.len() != expected {
            return Err(ModelError::LoadCorrupt(format!(
                "expected {expected} histogram bytes, got {}",
                blob.histograms.len()
            )));
        }

        let flat: Vec<f32> = blob
            .histograms
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let histograms = Array2::from_shape_vec((header.labels.len(), bins), flat)
            .map_err(|e| ModelError::LoadCorrupt(format!("histogram shape: {e}")))?;

        Ok(Self {
            params: header.params,
            patch_size: header.patch_size,
            labels: header.labels,
            histograms,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelHeader {
    format_version: u32,
    params: LbphParams,
    patch_size: u32,
    labels: Vec<Label>,
}

/// Serialized model: JSON header, little-endian f32 histogram matrix and a
/// SHA-256 digest over both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelBlob {
    pub header: String,
    pub histograms: Vec<u8>,
    pub digest: Vec<u8>,
}

fn blob_digest(header: &str, histograms: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(header.as_bytes());
    hasher.update(histograms);
    hasher.finalize().to_vec()
}

/// LBP code image for a square patch; the `radius`-wide border is dropped.
///
/// Bit order runs clockwise from the top-left neighbour; a bit is set when
/// the neighbour is at least as bright as the centre.
fn lbp_codes(patch: &Patch, radius: u32) -> (Vec<u8>, usize) {
    let size = patch.size as usize;
    let r = radius as isize;
    let inner = size - 2 * radius as usize;
    let offsets: [(isize, isize); 8] = [
        (-r, -r),
        (0, -r),
        (r, -r),
        (r, 0),
        (r, r),
        (0, r),
        (-r, r),
        (-r, 0),
    ];

    let mut codes = vec![0u8; inner * inner];
    for y in 0..inner {
        for x in 0..inner {
            let cx = (x + radius as usize) as isize;
            let cy = (y + radius as usize) as isize;
            let center = patch.data[cy as usize * size + cx as usize];
            let mut code = 0u8;
            for (bit, (dx, dy)) in offsets.iter().enumerate() {
                let n = patch.data[(cy + dy) as usize * size + (cx + dx) as usize];
                if n >= center {
                    code |= 1 << bit;
                }
            }
            codes[y * inner + x] = code;
        }
    }

    (codes, inner)
}

/// Concatenated per-cell histograms, each normalised to sum to 1.
fn spatial_histogram(patch: &Patch, params: &LbphParams) -> Vec<f32> {
    let (codes, inner) = lbp_codes(patch, params.radius);
    let (gx, gy) = (params.grid_x as usize, params.grid_y as usize);
    let cell_w = inner / gx;
    let cell_h = inner / gy;
    let norm = 1.0 / (cell_w * cell_h) as f32;

    let mut hist = vec![0f32; params.histogram_len()];
    for row in 0..gy {
        for col in 0..gx {
            let cell = &mut hist[(row * gx + col) * LBP_BINS..(row * gx + col + 1) * LBP_BINS];
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    cell[codes[y * inner + x] as usize] += 1.0;
                }
            }
            cell.iter_mut().for_each(|v| *v *= norm);
        }
    }

    hist
}

/// Symmetric chi-square distance `2 Σ (a-b)² / (a+b)`.
fn chi_square(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&a, &b)| {
            let s = a + b;
            if s > CHI_SQUARE_EPS {
                (a - b) * (a - b) / s
            } else {
                0.0
            }
        })
        .sum::<f32>()
        * 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SIZE: u32 = 64;

    fn noise_patch(seed: u64) -> Patch {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..SIZE * SIZE).map(|_| rng.gen_range(20..200u8)).collect();
        Patch::new(data, SIZE).unwrap()
    }

    fn stripe_patch(period: u32) -> Patch {
        let data = (0..SIZE)
            .flat_map(|_| (0..SIZE).map(move |x| if (x / period) % 2 == 0 { 60 } else { 180 }))
            .collect();
        Patch::new(data, SIZE).unwrap()
    }

    fn brighter(patch: &Patch, delta: u8) -> Patch {
        Patch::new(patch.data.iter().map(|&p| p + delta).collect(), patch.size).unwrap()
    }

    #[test]
    fn test_empty_training_set() {
        let err = LbphModel::train(LbphParams::default(), std::iter::empty()).unwrap_err();
        assert!(matches!(err, ModelError::EmptyTrainingSet));
    }

    #[test]
    fn test_rejects_mixed_patch_sizes() {
        let a = noise_patch(1);
        let b = Patch::new(vec![0; 32 * 32], 32).unwrap();
        let err = LbphModel::train(LbphParams::default(), [(0, &a), (1, &b)]).unwrap_err();
        assert!(matches!(err, ModelError::PatchSizeMismatch { expected: 64, actual: 32 }));
    }

    #[test]
    fn test_rejects_tiny_patch() {
        let tiny = Patch::new(vec![0; 9], 3).unwrap();
        let err = LbphModel::train(LbphParams::default(), [(0, &tiny)]).unwrap_err();
        assert!(matches!(err, ModelError::InvalidParams(_)));
    }

    #[test]
    fn test_histogram_cells_sum_to_one() {
        let params = LbphParams::default();
        let hist = spatial_histogram(&noise_patch(7), &params);
        assert_eq!(hist.len(), params.histogram_len());
        for cell in hist.chunks(LBP_BINS) {
            assert!((cell.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_lbp_invariant_to_brightness_shift() {
        let patch = noise_patch(3);
        let (a, _) = lbp_codes(&patch, 1);
        let (b, _) = lbp_codes(&brighter(&patch, 40), 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_lbp_uniform_patch_sets_all_bits() {
        let patch = Patch::new(vec![90; 16], 4).unwrap();
        let (codes, inner) = lbp_codes(&patch, 1);
        assert_eq!(inner, 2);
        assert!(codes.iter().all(|&c| c == 0xFF));
    }

    #[test]
    fn test_predict_nearest_label() {
        let alice = noise_patch(11);
        let bob = stripe_patch(4);
        let model = LbphModel::train(LbphParams::default(), [(0, &alice), (1, &bob)]).unwrap();

        let p = model.predict(&brighter(&alice, 15)).unwrap();
        assert_eq!(p.label, 0);
        assert_eq!(p.distance, 0.0);

        let p = model.predict(&bob).unwrap();
        assert_eq!(p.label, 1);
        assert_eq!(p.sample_index, 1);

        let stranger = model.predict(&noise_patch(99)).unwrap();
        assert!(stranger.distance > 0.0);
    }

    #[test]
    fn test_ties_pick_earliest_row() {
        let patch = noise_patch(5);
        let model = LbphModel::train(LbphParams::default(), [(2, &patch), (3, &patch), (2, &patch)]).unwrap();
        let p = model.predict(&patch).unwrap();
        assert_eq!((p.label, p.sample_index), (2, 0));
    }

    #[test]
    fn test_training_is_deterministic() {
        let patches: Vec<Patch> = (0..6).map(noise_patch).collect();
        let train = || {
            LbphModel::train(
                LbphParams::default(),
                patches.iter().enumerate().map(|(i, p)| ((i / 2) as Label, p)),
            )
            .unwrap()
        };
        let probe = noise_patch(42);
        assert_eq!(train().predict(&probe).unwrap(), train().predict(&probe).unwrap());
    }

    #[test]
    fn test_predict_size_mismatch() {
        let model = LbphModel::train(LbphParams::default(), [(0, &noise_patch(1))]).unwrap();
        let probe = Patch::new(vec![0; 100 * 100], 100).unwrap();
        assert!(matches!(
            model.predict(&probe),
            Err(ModelError::PatchSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_blob_restores_predictions() {
        let a = noise_patch(21);
        let b = stripe_patch(3);
        let model = LbphModel::train(LbphParams::default(), [(0, &a), (4, &b)]).unwrap();
        let restored = LbphModel::from_blob(&model.to_blob()).unwrap();
        assert_eq!(restored.len(), 2);
        let probe = noise_patch(22);
        assert_eq!(model.predict(&probe).unwrap(), restored.predict(&probe).unwrap());
    }

    #[test]
    fn test_blob_detects_corruption() {
        let model = LbphModel::train(LbphParams::default(), [(0, &noise_patch(1))]).unwrap();

        let mut flipped = model.to_blob();
        flipped.histograms[10] ^= 0xFF;
        assert!(matches!(LbphModel::from_blob(&flipped), Err(ModelError::LoadCorrupt(_))));

        let mut truncated = model.to_blob();
        truncated.histograms.truncate(8);
        truncated.digest = blob_digest(&truncated.header, &truncated.histograms);
        assert!(matches!(LbphModel::from_blob(&truncated), Err(ModelError::LoadCorrupt(_))));

        let mut garbage = model.to_blob();
        garbage.header = "not json".into();
        garbage.digest = blob_digest(&garbage.header, &garbage.histograms);
        assert!(matches!(LbphModel::from_blob(&garbage), Err(ModelError::LoadCorrupt(_))));
    }
}

//! Viola-Jones Haar cascade detector.
//!
//! Evaluates a boosted cascade of Haar-like features over a multi-scale
//! sliding window, using integral images for constant-time rectangle sums
//! and per-window variance normalisation. Raw hits are merged with
//! OpenCV-style neighbour grouping.
//!
//! Cascades load from OpenCV's `haarcascade_*.xml` files or from a compact
//! JSON form of the same model. Feature values are normalised the way
//! OpenCV's Haar evaluator does it: variance over the window inset by one
//! base pixel, rect weights scaled by the inverse of that inset area, and the
//! first rect's weight rebalanced against the scaled areas of the others.

use crate::locator::RegionDetector;
use crate::types::{Frame, Rect};
use roxmltree::Node;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

// --- Named constants ---
const GROUP_EPS: f32 = 0.2;
/// The variance inset needs at least one interior pixel.
const MIN_WINDOW: u32 = 3;
const MAX_FEATURE_RECTS: usize = 3;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("cascade read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cascade parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cascade XML malformed: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

/// One weighted rectangle of a Haar feature, in base-window coordinates.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

/// Decision stump over one Haar feature.
#[derive(Debug, Clone, Deserialize)]
pub struct CascadeNode {
    pub rects: Vec<WeightedRect>,
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CascadeStage {
    pub threshold: f32,
    pub nodes: Vec<CascadeNode>,
}

/// A trained cascade.
#[derive(Debug, Clone, Deserialize)]
pub struct HaarCascade {
    /// Base window (width, height).
    pub window: (u32, u32),
    pub stages: Vec<CascadeStage>,
}

impl HaarCascade {
    /// Load a cascade file, OpenCV XML or JSON, sniffed from the content.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let cascade = if text.trim_start().starts_with('<') {
            Self::from_opencv_xml(&text)?
        } else {
            Self::from_json(&text)?
        };

        tracing::info!(
            path = %path.display(),
            window = ?cascade.window,
            stages = cascade.stages.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    pub fn from_json(text: &str) -> Result<Self, CascadeError> {
        let cascade: HaarCascade = serde_json::from_str(text)?;
        cascade.validate()?;
        Ok(cascade)
    }

    /// Parse OpenCV's `opencv_storage` XML as written by
    /// `opencv_traincascade`. Accepts BOOST/HAAR cascades whose weak
    /// classifiers are single splits over upright features.
    pub fn from_opencv_xml(text: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(text)?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| CascadeError::Invalid("no <cascade> element".into()))?;

        let stage_type = child_text(root, "stageType")?;
        if stage_type != "BOOST" {
            return Err(CascadeError::Invalid(format!("unsupported stageType {stage_type}")));
        }
        let feature_type = child_text(root, "featureType")?;
        if feature_type != "HAAR" {
            return Err(CascadeError::Invalid(format!("unsupported featureType {feature_type}")));
        }
        let window = (
            number(child_text(root, "width")?, "width")?,
            number(child_text(root, "height")?, "height")?,
        );

        let features = items(child(root, "features")?)
            .enumerate()
            .map(|(i, feature)| parse_feature(i, feature))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(child(root, "stages")?)
            .enumerate()
            .map(|(s, stage)| {
                let threshold = number(child_text(stage, "stageThreshold")?, "stageThreshold")?;
                let nodes = items(child(stage, "weakClassifiers")?)
                    .map(|weak| parse_stump(s, weak, &features))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CascadeStage { threshold, nodes })
            })
            .collect::<Result<Vec<_>, CascadeError>>()?;

        let cascade = HaarCascade { window, stages };
        cascade.validate()?;
        Ok(cascade)
    }

    fn validate(&self) -> Result<(), CascadeError> {
        let (w, h) = self.window;
        if w < MIN_WINDOW || h < MIN_WINDOW {
            return Err(CascadeError::Invalid(format!(
                "window {w}x{h} is smaller than {MIN_WINDOW}x{MIN_WINDOW}"
            )));
        }
        if self.stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }
        let outside = |start: u32, len: u32, limit: u32| start.checked_add(len).map_or(true, |end| end > limit);
        for (s, stage) in self.stages.iter().enumerate() {
            for node in &stage.nodes {
                if !(2..=MAX_FEATURE_RECTS).contains(&node.rects.len()) {
                    return Err(CascadeError::Invalid(format!(
                        "stage {s}: feature has {} rects, expected 2 to {MAX_FEATURE_RECTS}",
                        node.rects.len()
                    )));
                }
                for r in &node.rects {
                    if outside(r.x, r.width, w) || outside(r.y, r.height, h) {
                        return Err(CascadeError::Invalid(format!(
                            "stage {s}: feature rect {r:?} exceeds window {w}x{h}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Test one window at `(x, y)` scaled by `scale`.
    fn evaluate_window(&self, integral: &IntegralImage, x: u32, y: u32, scale: f32) -> bool {
        let win_w = (self.window.0 as f32 * scale) as u32;
        let win_h = (self.window.1 as f32 * scale) as u32;

        // Variance over the window inset by one base pixel on every side.
        let inset = (scale.round() as u32).min(win_w / 2).min(win_h / 2);
        let norm_w = (((self.window.0 - 2) as f32 * scale).round() as u32).min(win_w - 2 * inset).max(1);
        let norm_h = (((self.window.1 - 2) as f32 * scale).round() as u32).min(win_h - 2 * inset).max(1);
        let inv_area = 1.0 / (norm_w as f64 * norm_h as f64);

        let sum = integral.sum(x + inset, y + inset, norm_w, norm_h) as f64;
        let sq_sum = integral.sq_sum(x + inset, y + inset, norm_w, norm_h) as f64;
        let mean = sum * inv_area;
        let variance = sq_sum * inv_area - mean * mean;
        let stddev = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut stage_sum = 0.0f32;
            for node in &stage.nodes {
                let mut value = 0.0f64;
                let mut rest_weighted_area = 0.0f64;
                let mut first = (0u64, 0.0f64);
                for (k, r) in node.rects.iter().enumerate() {
                    let rx = x + (r.x as f32 * scale) as u32;
                    let ry = y + (r.y as f32 * scale) as u32;
                    let rw = (r.width as f32 * scale) as u32;
                    let rh = (r.height as f32 * scale) as u32;
                    let rect_sum = integral.sum(rx, ry, rw, rh);
                    let area = (rw as f64) * (rh as f64);
                    if k == 0 {
                        first = (rect_sum, area);
                    } else {
                        let weight = r.weight as f64 * inv_area;
                        value += weight * rect_sum as f64;
                        rest_weighted_area += weight * area;
                    }
                }
                let (first_sum, first_area) = first;
                if first_area > 0.0 {
                    value -= rest_weighted_area / first_area * first_sum as f64;
                }

                stage_sum += if value < node.threshold as f64 * stddev {
                    node.left
                } else {
                    node.right
                };
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }
}

/// Element children named `_`, OpenCV's tag for sequence items.
fn items<'a, 'i>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.has_tag_name("_"))
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>, CascadeError> {
    node.children().find(|n| n.has_tag_name(name)).ok_or_else(|| {
        CascadeError::Invalid(format!("<{}> has no <{name}>", node.tag_name().name()))
    })
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, CascadeError> {
    Ok(child(node, name)?.text().unwrap_or_default().trim())
}

fn number<T: FromStr>(token: &str, what: &str) -> Result<T, CascadeError> {
    token
        .parse()
        .map_err(|_| CascadeError::Invalid(format!("bad {what} value {token:?}")))
}

fn numbers<T: FromStr>(text: &str, what: &str) -> Result<Vec<T>, CascadeError> {
    text.split_whitespace().map(|t| number(t, what)).collect()
}

fn parse_feature(index: usize, feature: Node<'_, '_>) -> Result<Vec<WeightedRect>, CascadeError> {
    if let Some(tilted) = feature.children().find(|n| n.has_tag_name("tilted")) {
        if tilted.text().map(str::trim) != Some("0") {
            return Err(CascadeError::Invalid(format!("feature {index} is tilted")));
        }
    }
    items(child(feature, "rects")?)
        .map(|rect| {
            let text = rect.text().unwrap_or_default();
            let fields: Vec<&str> = text.split_whitespace().collect();
            let [x, y, width, height, weight] = fields[..] else {
                return Err(CascadeError::Invalid(format!(
                    "feature {index}: rect {text:?} needs 5 fields"
                )));
            };
            Ok(WeightedRect {
                x: number(x, "rect x")?,
                y: number(y, "rect y")?,
                width: number(width, "rect width")?,
                height: number(height, "rect height")?,
                weight: number(weight, "rect weight")?,
            })
        })
        .collect()
}

/// A weak classifier as `internalNodes = "left right feature threshold"`;
/// non-positive children index `leafValues` negated.
fn parse_stump(
    stage: usize,
    weak: Node<'_, '_>,
    features: &[Vec<WeightedRect>],
) -> Result<CascadeNode, CascadeError> {
    let internal: Vec<f64> = numbers(child_text(weak, "internalNodes")?, "internalNodes")?;
    let leaves: Vec<f32> = numbers(child_text(weak, "leafValues")?, "leafValues")?;
    let [left, right, feature, threshold] = internal[..] else {
        return Err(CascadeError::Invalid(format!(
            "stage {stage}: weak classifier with {} split values; only single splits are supported",
            internal.len()
        )));
    };

    let leaf = |child: f64| {
        (child <= 0.0)
            .then(|| leaves.get((-child) as usize).copied())
            .flatten()
            .ok_or_else(|| CascadeError::Invalid(format!("stage {stage}: child {child} is not a leaf")))
    };
    let rects = (feature >= 0.0)
        .then(|| features.get(feature as usize).cloned())
        .flatten()
        .ok_or_else(|| CascadeError::Invalid(format!("stage {stage}: no feature {feature}")))?;

    Ok(CascadeNode {
        rects,
        threshold: threshold as f32,
        left: leaf(left)?,
        right: leaf(right)?,
    })
}

/// Sliding-window policy. Tunable constants, not derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    pub scale_factor: f32,
    pub min_neighbors: usize,
    pub min_size: u32,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.3,
            min_neighbors: 5,
            min_size: 30,
        }
    }
}

/// A cascade paired with its sliding-window policy.
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: DetectParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: DetectParams) -> Self {
        Self { cascade, params }
    }

    /// All windows accepted by the cascade, before grouping.
    fn raw_hits(&self, frame: &Frame) -> Vec<Rect> {
        let integral = IntegralImage::new(frame);
        let (base_w, base_h) = self.cascade.window;
        let scale_factor = self.params.scale_factor.max(1.01);
        let mut hits = Vec::new();

        let mut scale = 1.0f32;
        loop {
            let win_w = (base_w as f32 * scale) as u32;
            let win_h = (base_h as f32 * scale) as u32;
            if win_w > frame.width || win_h > frame.height {
                break;
            }
            if win_w >= self.params.min_size && win_h >= self.params.min_size {
                let step = if scale > 2.0 { scale.round() as u32 } else { 2 };
                let mut y = 0;
                while y + win_h <= frame.height {
                    let mut x = 0;
                    while x + win_w <= frame.width {
                        if self.cascade.evaluate_window(&integral, x, y, scale) {
                            hits.push(Rect::new(x, y, win_w, win_h));
                        }
                        x += step;
                    }
                    y += step;
                }
            }
            scale *= scale_factor;
        }

        hits
    }
}

impl RegionDetector for CascadeDetector {
    fn detect(&self, frame: &Frame) -> Vec<Rect> {
        let hits = self.raw_hits(frame);
        let raw = hits.len();
        let grouped = group_rectangles(hits, self.params.min_neighbors, GROUP_EPS);
        tracing::debug!(raw, grouped = grouped.len(), "cascade detection");
        grouped
    }
}

/// Summed-area tables over pixel values and squared pixel values.
struct IntegralImage {
    stride: usize,
    sums: Vec<u64>,
    sq_sums: Vec<u64>,
}

impl IntegralImage {
    fn new(frame: &Frame) -> Self {
        let w = frame.width as usize;
        let h = frame.height as usize;
        let stride = w + 1;
        let mut sums = vec![0u64; stride * (h + 1)];
        let mut sq_sums = vec![0u64; stride * (h + 1)];

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = frame.data[y * w + x] as u64;
                row_sum += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sums[idx] = sums[idx - stride] + row_sum;
                sq_sums[idx] = sq_sums[idx - stride] + row_sq;
            }
        }

        Self { stride, sums, sq_sums }
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y1 * stride + x0]
            - table[y0 * stride + x1]
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sums, self.stride, x, y, w, h)
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sq_sums, self.stride, x, y, w, h)
    }
}

/// Whether two rectangles describe the same object (OpenCV `SimilarRects`).
fn similar(a: &Rect, b: &Rect, eps: f32) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f32 * 0.5;
    let close = |p: u32, q: u32| (p as f32 - q as f32).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster raw hits, keep clusters with more than `min_neighbors` members,
/// average each cluster and drop clusters nested inside a stronger one.
///
/// With `min_neighbors == 0` raw hits are returned unchanged.
pub fn group_rectangles(rects: Vec<Rect>, min_neighbors: usize, eps: f32) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects;
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let ri = find_root(&mut parent, i);
                let rj = find_root(&mut parent, j);
                if ri != rj {
                    parent[rj.max(ri)] = ri.min(rj);
                }
            }
        }
    }

    // Clusters in order of first appearance.
    let mut order: Vec<usize> = Vec::new();
    let mut totals: Vec<[u64; 4]> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find_root(&mut parent, i);
        let slot = match order.iter().position(|&o| o == root) {
            Some(slot) => slot,
            None => {
                order.push(root);
                totals.push([0; 4]);
                counts.push(0);
                order.len() - 1
            }
        };
        totals[slot][0] += r.x as u64;
        totals[slot][1] += r.y as u64;
        totals[slot][2] += r.width as u64;
        totals[slot][3] += r.height as u64;
        counts[slot] += 1;
    }

    let clusters: Vec<(Rect, usize)> = totals
        .iter()
        .zip(&counts)
        .filter(|&(_, &c)| c > min_neighbors)
        .map(|(t, &c)| {
            let c64 = c as u64;
            let avg = |v: u64| ((v * 2 + c64) / (c64 * 2)) as u32;
            (Rect::new(avg(t[0]), avg(t[1]), avg(t[2]), avg(t[3])), c)
        })
        .collect();

    clusters
        .iter()
        .enumerate()
        .filter(|(i, (r, count))| {
            !clusters.iter().enumerate().any(|(j, (outer, outer_count))| {
                if *i == j || *outer_count < 3.max(*count) {
                    return false;
                }
                let dx = (outer.width as f32 * eps).round() as u32;
                let dy = (outer.height as f32 * eps).round() as u32;
                r.x + dx >= outer.x
                    && r.y + dy >= outer.y
                    && r.x + r.width <= outer.x + outer.width + dx
                    && r.y + r.height <= outer.y + outer.height + dy
                    && r.area() < outer.area()
            })
        })
        .map(|(_, (r, _))| *r)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One stage, one edge feature: bright left half, dark right half.
    const EDGE_CASCADE: &str = r#"{
        "window": [4, 4],
        "stages": [
            {
                "threshold": 0.5,
                "nodes": [
                    {
                        "rects": [
                            { "x": 0, "y": 0, "width": 2, "height": 4, "weight": 1.0 },
                            { "x": 2, "y": 0, "width": 2, "height": 4, "weight": -1.0 }
                        ],
                        "threshold": 0.5,
                        "left": 0.0,
                        "right": 1.0
                    }
                ]
            }
        ]
    }"#;

    fn edge_frame() -> Frame {
        let (w, h) = (40u32, 40u32);
        let mut data = vec![100u8; (w * h) as usize];
        for y in 12..28 {
            for x in 12..28 {
                data[(y * w + x) as usize] = if x < 20 { 200 } else { 20 };
            }
        }
        Frame::new(data, w, h).unwrap()
    }

    fn raw_params() -> DetectParams {
        DetectParams {
            scale_factor: 1.25,
            min_neighbors: 0,
            min_size: 4,
        }
    }

    #[test]
    fn test_parse_and_validate() {
        let cascade = HaarCascade::from_json(EDGE_CASCADE).unwrap();
        assert_eq!(cascade.window, (4, 4));
        assert_eq!(cascade.stages[0].nodes[0].rects.len(), 2);

        let bad = EDGE_CASCADE.replace("\"x\": 2", "\"x\": 3");
        assert!(matches!(HaarCascade::from_json(&bad), Err(CascadeError::Invalid(_))));
        assert!(matches!(HaarCascade::from_json("{"), Err(CascadeError::Parse(_))));
    }

    #[test]
    fn test_rect_extent_overflow_is_invalid() {
        let huge = EDGE_CASCADE.replace("\"x\": 2,", "\"x\": 4294967295,");
        assert!(matches!(HaarCascade::from_json(&huge), Err(CascadeError::Invalid(_))));
        let tall = EDGE_CASCADE.replace("\"y\": 0, \"width\": 2, \"height\": 4, \"weight\": -1.0", "\"y\": 4294967295, \"width\": 2, \"height\": 4, \"weight\": -1.0");
        assert!(matches!(HaarCascade::from_json(&tall), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_single_rect_feature_rejected() {
        let single = r#"{
            "window": [4, 4],
            "stages": [{ "threshold": 0.5, "nodes": [{
                "rects": [{ "x": 0, "y": 0, "width": 2, "height": 4, "weight": 1.0 }],
                "threshold": 0.5, "left": 0.0, "right": 1.0
            }] }]
        }"#;
        assert!(matches!(HaarCascade::from_json(single), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = HaarCascade::load(Path::new("/nonexistent/cascade.json")).unwrap_err();
        assert!(matches!(err, CascadeError::NotFound(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.json");
        std::fs::write(&path, EDGE_CASCADE).unwrap();
        assert!(HaarCascade::load(&path).is_ok());
    }

    #[test]
    fn test_integral_sums() {
        let frame = Frame::new((1..=9).collect(), 3, 3).unwrap();
        let integral = IntegralImage::new(&frame);
        assert_eq!(integral.sum(0, 0, 3, 3), 45);
        assert_eq!(integral.sum(1, 1, 2, 2), 5 + 6 + 8 + 9);
        assert_eq!(integral.sq_sum(0, 0, 1, 2), 1 + 16);
    }

    #[test]
    fn test_uniform_frame_has_no_hits() {
        let cascade = HaarCascade::from_json(EDGE_CASCADE).unwrap();
        let detector = CascadeDetector::new(cascade, raw_params());
        let frame = Frame::new(vec![90u8; 40 * 40], 40, 40).unwrap();
        assert!(detector.detect(&frame).is_empty());
    }

    #[test]
    fn test_edge_hits_cover_the_edge() {
        let cascade = HaarCascade::from_json(EDGE_CASCADE).unwrap();
        let detector = CascadeDetector::new(cascade, raw_params());
        let hits = detector.detect(&edge_frame());
        assert!(!hits.is_empty());
        // Every hit must straddle the bright/dark boundary at x = 20.
        for r in &hits {
            assert!(r.x < 20 && r.x + r.width > 20, "hit {r:?} misses the edge");
        }
    }

    #[test]
    fn test_min_size_filters_small_windows() {
        let cascade = HaarCascade::from_json(EDGE_CASCADE).unwrap();
        let params = DetectParams {
            min_size: 12,
            ..raw_params()
        };
        let hits = CascadeDetector::new(cascade, params).detect(&edge_frame());
        assert!(hits.iter().all(|r| r.width >= 12 && r.height >= 12));
    }

    #[test]
    fn test_group_merges_neighbours() {
        let rects = vec![
            Rect::new(10, 10, 40, 40),
            Rect::new(11, 10, 40, 40),
            Rect::new(10, 12, 40, 40),
            Rect::new(200, 200, 40, 40),
        ];
        let grouped = group_rectangles(rects, 2, GROUP_EPS);
        assert_eq!(grouped, vec![Rect::new(10, 11, 40, 40)]);
    }

    #[test]
    fn test_group_drops_nested_cluster() {
        let mut rects = Vec::new();
        for d in 0..4 {
            rects.push(Rect::new(100 + d, 100, 100, 100));
        }
        for d in 0..2 {
            rects.push(Rect::new(130 + d, 130, 30, 30));
        }
        let grouped = group_rectangles(rects, 1, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].width, 100);
    }

    #[test]
    fn test_group_zero_neighbors_passthrough() {
        let rects = vec![Rect::new(0, 0, 5, 5), Rect::new(1, 0, 5, 5)];
        assert_eq!(group_rectangles(rects.clone(), 0, GROUP_EPS), rects);
    }

    const FRONTAL_XML: &str = include_str!("../testdata/frontal_stumps.xml");

    /// 24x24 face template: dark eyes either side of a bright bridge, a
    /// dark mouth below, on uniform skin.
    fn face_template(u: u32, v: u32) -> u8 {
        let eyes = (7..10).contains(&v) && ((4..10).contains(&u) || (14..20).contains(&u));
        let mouth = (17..19).contains(&v) && (8..16).contains(&u);
        if eyes {
            60
        } else if mouth {
            80
        } else {
            170
        }
    }

    /// The template drawn at twice its size with its corner at (40, 32).
    fn face_frame(upside_down: bool) -> Frame {
        let (w, h) = (160u32, 120u32);
        let mut data = vec![110u8; (w * h) as usize];
        for y in 0..48 {
            for x in 0..48 {
                let v = if upside_down { 23 - y / 2 } else { y / 2 };
                data[((32 + y) * w + 40 + x) as usize] = face_template(x / 2, v);
            }
        }
        Frame::new(data, w, h).unwrap()
    }

    fn doubling_params() -> DetectParams {
        DetectParams {
            scale_factor: 2.0,
            min_neighbors: 0,
            min_size: 24,
        }
    }

    #[test]
    fn test_opencv_xml_parse() {
        let cascade = HaarCascade::from_opencv_xml(FRONTAL_XML).unwrap();
        assert_eq!(cascade.window, (24, 24));
        assert_eq!(cascade.stages.len(), 2);
        assert_eq!(cascade.stages[0].threshold, 2.5);
        assert_eq!(cascade.stages[0].nodes.len(), 2);

        let eyes = &cascade.stages[0].nodes[0];
        assert_eq!((eyes.left, eyes.right), (2.0, -2.0));
        assert_eq!(eyes.rects.len(), 2);
        assert_eq!((eyes.rects[1].x, eyes.rects[1].y, eyes.rects[1].width), (6, 7, 12));
        assert_eq!(eyes.rects[1].weight, 3.0);
        let mouth = &cascade.stages[1].nodes[0];
        assert_eq!(mouth.rects[0].y, 15);
    }

    #[test]
    fn test_opencv_xml_rejections() {
        let lbp = FRONTAL_XML.replace("<featureType>HAAR", "<featureType>LBP");
        assert!(matches!(HaarCascade::from_opencv_xml(&lbp), Err(CascadeError::Invalid(_))));

        let tree = FRONTAL_XML.replace("0 -1 2 -5.0000000745058060e-02", "1 -1 2 -0.05 0 -2 0 0.1");
        assert!(matches!(HaarCascade::from_opencv_xml(&tree), Err(CascadeError::Invalid(_))));

        let tilted = FRONTAL_XML.replace(
            "6 17 12 2 3.</_></rects></_>",
            "6 17 12 2 3.</_></rects>\n      <tilted>1</tilted></_>",
        );
        assert!(matches!(HaarCascade::from_opencv_xml(&tilted), Err(CascadeError::Invalid(_))));

        let missing = FRONTAL_XML.replace(" 0 -1 1 ", " 0 -1 7 ");
        assert!(matches!(HaarCascade::from_opencv_xml(&missing), Err(CascadeError::Invalid(_))));

        assert!(matches!(
            HaarCascade::from_opencv_xml("<opencv_storage><cascade>"),
            Err(CascadeError::Xml(_))
        ));
    }

    #[test]
    fn test_load_sniffs_xml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haarcascade_frontalface_test.xml");
        std::fs::write(&path, FRONTAL_XML).unwrap();
        let cascade = HaarCascade::load(&path).unwrap();
        assert_eq!(cascade.stages.len(), 2);
    }

    #[test]
    fn test_opencv_cascade_finds_face() {
        let cascade = HaarCascade::from_opencv_xml(FRONTAL_XML).unwrap();
        let detector = CascadeDetector::new(cascade, doubling_params());
        let hits = detector.raw_hits(&face_frame(false));
        assert!(
            hits.contains(&Rect::new(40, 32, 48, 48)),
            "face window missing from {hits:?}"
        );
    }

    #[test]
    fn test_opencv_cascade_rejects_non_faces() {
        let cascade = HaarCascade::from_opencv_xml(FRONTAL_XML).unwrap();
        let detector = CascadeDetector::new(cascade, doubling_params());

        let hits = detector.raw_hits(&face_frame(true));
        assert!(!hits.contains(&Rect::new(40, 32, 48, 48)));

        let blank = Frame::new(vec![110u8; 160 * 120], 160, 120).unwrap();
        assert!(detector.raw_hits(&blank).is_empty());
    }
}

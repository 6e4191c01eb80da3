use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Dense integer identity assigned to an enrolled person. Never reused.
pub type Label = u32;

/// A grayscale frame handed to the engine by its caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes, row-major).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height })
    }

    /// Convert any decoded image to 8-bit luma.
    pub fn from_image(image: &DynamicImage) -> Self {
        Self::from_luma(image.to_luma8())
    }

    pub fn from_luma(image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
        }
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// Horizontally mirrored copy.
    pub fn mirrored(&self) -> Self {
        let w = self.width as usize;
        let data = self
            .data
            .chunks_exact(w.max(1))
            .flat_map(|row| row.iter().rev().copied())
            .collect();
        Self {
            data,
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Detection pass that produced a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    Frontal,
    ProfileLeft,
    ProfileRight,
}

impl View {
    pub fn as_str(&self) -> &'static str {
        match self {
            View::Frontal => "frontal",
            View::ProfileLeft => "profile_left",
            View::ProfileRight => "profile_right",
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for View {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "frontal" => Ok(View::Frontal),
            "profile_left" => Ok(View::ProfileLeft),
            "profile_right" => Ok(View::ProfileRight),
            other => Err(format!("unknown view: {other}")),
        }
    }
}

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// A located face: rectangle plus the pass that found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub view: View,
}

impl Region {
    pub fn from_rect(rect: Rect, view: View) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            view,
        }
    }
}

/// Canonical square grayscale patch, the unit stored and compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub data: Vec<u8>,
    pub size: u32,
}

impl Patch {
    pub fn new(data: Vec<u8>, size: u32) -> Result<Self, FrameError> {
        let expected = size as usize * size as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, size })
    }
}

/// A normalized patch waiting to be stored, tagged with its view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSample {
    pub view: View,
    pub patch: Patch,
}

/// A stored sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub label: Label,
    pub view: View,
    pub patch: Patch,
}

/// Bidirectional `person_id ↔ label` mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMap {
    by_name: BTreeMap<String, Label>,
    by_label: BTreeMap<Label, String>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, person_id: impl Into<String>, label: Label) {
        let person_id = person_id.into();
        if let Some(old) = self.by_name.insert(person_id.clone(), label) {
            self.by_label.remove(&old);
        }
        self.by_label.insert(label, person_id);
    }

    pub fn label(&self, person_id: &str) -> Option<Label> {
        self.by_name.get(person_id).copied()
    }

    pub fn person(&self, label: Label) -> Option<&str> {
        self.by_label.get(&label).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_label.is_empty()
    }

    /// Entries ordered by label.
    pub fn iter(&self) -> impl Iterator<Item = (Label, &str)> {
        self.by_label.iter().map(|(l, n)| (*l, n.as_str()))
    }
}

/// Enrollment subsampling: keep every `stride`-th accepted frame, at most
/// `cap` per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingPolicy {
    pub stride: usize,
    pub cap: usize,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self { stride: 5, cap: 100 }
    }
}

impl SamplingPolicy {
    pub fn select<T>(&self, accepted: impl IntoIterator<Item = T>) -> Vec<T> {
        accepted
            .into_iter()
            .step_by(self.stride.max(1))
            .take(self.cap)
            .collect()
    }
}

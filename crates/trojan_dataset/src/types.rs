//! Core types and error definitions for trojan_dataset.

use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("sample has {got} values, expected {expected} for shape {shape:?}")]
    ShapeMismatch {
        got: usize,
        expected: usize,
        shape: [usize; 3],
    },
    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("{0} is empty")]
    Empty(&'static str),
    #[error("{0}")]
    Other(String),
}

/// One labeled image in CHW layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub input: Vec<f32>,
    pub label: i64,
}

/// Images stored back to back as flat CHW `f32` values with one label each.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSet {
    data_shape: [usize; 3],
    inputs: Vec<f32>,
    labels: Vec<i64>,
}

impl ImageSet {
    pub fn new(data_shape: [usize; 3]) -> Self {
        Self {
            data_shape,
            inputs: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn from_parts(
        data_shape: [usize; 3],
        inputs: Vec<f32>,
        labels: Vec<i64>,
    ) -> DatasetResult<Self> {
        let numel = data_shape.iter().product::<usize>();
        if inputs.len() != numel * labels.len() {
            return Err(DatasetError::ShapeMismatch {
                got: inputs.len(),
                expected: numel * labels.len(),
                shape: data_shape,
            });
        }
        Ok(Self {
            data_shape,
            inputs,
            labels,
        })
    }

    pub fn data_shape(&self) -> [usize; 3] {
        self.data_shape
    }

    /// Values per sample (`C * H * W`).
    pub fn sample_numel(&self) -> usize {
        self.data_shape.iter().product()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    pub fn inputs(&self) -> &[f32] {
        &self.inputs
    }

    /// Number of classes implied by the largest label.
    pub fn num_classes(&self) -> usize {
        self.labels
            .iter()
            .copied()
            .max()
            .map(|m| (m.max(0) + 1) as usize)
            .unwrap_or(0)
    }

    pub fn input(&self, index: usize) -> DatasetResult<&[f32]> {
        if index >= self.len() {
            return Err(DatasetError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        let numel = self.sample_numel();
        Ok(&self.inputs[index * numel..(index + 1) * numel])
    }

    pub fn get(&self, index: usize) -> DatasetResult<Sample> {
        Ok(Sample {
            input: self.input(index)?.to_vec(),
            label: self.labels[index],
        })
    }

    pub fn push(&mut self, input: &[f32], label: i64) -> DatasetResult<()> {
        if input.len() != self.sample_numel() {
            return Err(DatasetError::ShapeMismatch {
                got: input.len(),
                expected: self.sample_numel(),
                shape: self.data_shape,
            });
        }
        self.inputs.extend_from_slice(input);
        self.labels.push(label);
        Ok(())
    }

    pub fn subset(&self, indices: &[usize]) -> DatasetResult<Self> {
        let mut out = Self::new(self.data_shape);
        out.inputs.reserve(indices.len() * self.sample_numel());
        for &i in indices {
            let input = self.input(i)?;
            out.inputs.extend_from_slice(input);
            out.labels.push(self.labels[i]);
        }
        Ok(out)
    }

    /// Append `other` (same shape) after `self`.
    pub fn concat(mut self, other: &ImageSet) -> DatasetResult<Self> {
        if other.data_shape != self.data_shape {
            return Err(DatasetError::ShapeMismatch {
                got: other.sample_numel(),
                expected: self.sample_numel(),
                shape: self.data_shape,
            });
        }
        self.inputs.extend_from_slice(&other.inputs);
        self.labels.extend_from_slice(&other.labels);
        Ok(self)
    }

    /// Replace every label with `label`.
    pub fn relabel(mut self, label: i64) -> Self {
        self.labels.iter_mut().for_each(|l| *l = label);
        self
    }

    /// Keep the samples whose label satisfies `keep`.
    pub fn filter_labels(&self, keep: impl Fn(i64) -> bool) -> Self {
        let indices: Vec<usize> = self
            .labels
            .iter()
            .enumerate()
            .filter(|(_, l)| keep(**l))
            .map(|(i, _)| i)
            .collect();
        // Indices come from this set, so they are in range.
        self.subset(&indices).unwrap_or_else(|_| Self::new(self.data_shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_subset_preserve_samples() {
        let mut set = ImageSet::new([1, 1, 2]);
        set.push(&[0.0, 1.0], 0).unwrap();
        set.push(&[2.0, 3.0], 1).unwrap();
        set.push(&[4.0, 5.0], 2).unwrap();
        assert!(set.push(&[1.0], 0).is_err());

        let sub = set.subset(&[2, 0]).unwrap();
        assert_eq!(sub.labels(), &[2, 0]);
        assert_eq!(sub.input(0).unwrap(), &[4.0, 5.0]);
        assert_eq!(set.num_classes(), 3);
        assert!(set.subset(&[3]).is_err());
    }

    #[test]
    fn from_parts_checks_lengths() {
        assert!(ImageSet::from_parts([1, 2, 2], vec![0.0; 8], vec![0, 1]).is_ok());
        assert!(ImageSet::from_parts([1, 2, 2], vec![0.0; 7], vec![0, 1]).is_err());
    }

    #[test]
    fn relabel_and_filter() {
        let set = ImageSet::from_parts([1, 1, 1], vec![0.0, 1.0, 2.0], vec![0, 1, 1]).unwrap();
        assert_eq!(set.filter_labels(|l| l != 1).len(), 1);
        assert_eq!(set.relabel(4).labels(), &[4, 4, 4]);
    }
}

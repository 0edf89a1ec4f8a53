//! Per-class mark/loss archive written after every inspected class.
//!
//! Layout: a safetensors file holding `mark_list` (`F32`, `[N, C + 1, H, W]`)
//! and `loss_list` (`F32`, `[N]`), with string metadata `format_version`,
//! `attack`, `defense` and `target_class`.

use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{artifact_err, DefenseError, DefenseResult};

pub const FORMAT_VERSION: &str = "1";
const MARK_KEY: &str = "mark_list";
const LOSS_KEY: &str = "loss_list";

/// `{dir}/{attack}_{defense}_tar{target}.safetensors`
pub fn archive_path(dir: &Path, attack: &str, defense: &str, target_class: i64) -> PathBuf {
    dir.join(format!("{attack}_{defense}_tar{target_class}.safetensors"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkArchive {
    pub attack: String,
    pub defense: String,
    pub target_class: i64,
    /// `(C + 1, H, W)` of every mark.
    pub mark_shape: [usize; 3],
    /// Marks back to back, channel-major.
    pub mark_list: Vec<f32>,
    pub loss_list: Vec<f32>,
}

fn to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

impl MarkArchive {
    pub fn len(&self) -> usize {
        self.loss_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loss_list.is_empty()
    }

    fn mark_numel(&self) -> usize {
        self.mark_shape.iter().product()
    }

    /// Mark of class `index`, `(C + 1) * H * W` values.
    pub fn mark(&self, index: usize) -> Option<&[f32]> {
        let numel = self.mark_numel();
        self.mark_list.get(index * numel..(index + 1) * numel)
    }

    /// Write atomically: serialize into a temp file next to `path`, then rename.
    pub fn save(&self, path: &Path) -> DefenseResult<()> {
        let numel = self.mark_numel();
        if self.mark_list.len() != numel * self.len() {
            return Err(artifact_err(
                path,
                format!(
                    "{} mark values for {} losses of shape {:?}",
                    self.mark_list.len(),
                    self.len(),
                    self.mark_shape
                ),
            ));
        }
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|source| DefenseError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let [c, h, w] = self.mark_shape;
        let mark_bytes = to_bytes(&self.mark_list);
        let loss_bytes = to_bytes(&self.loss_list);
        let ser = |e: safetensors::SafeTensorError| artifact_err(path, e.to_string());
        let marks = TensorView::new(Dtype::F32, vec![self.len(), c, h, w], &mark_bytes).map_err(ser)?;
        let losses = TensorView::new(Dtype::F32, vec![self.len()], &loss_bytes).map_err(ser)?;
        let metadata: HashMap<String, String> = [
            ("format_version", FORMAT_VERSION.to_string()),
            ("attack", self.attack.clone()),
            ("defense", self.defense.clone()),
            ("target_class", self.target_class.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let bytes = safetensors::serialize(
            vec![(MARK_KEY, &marks), (LOSS_KEY, &losses)],
            &Some(metadata),
        )
        .map_err(ser)?;

        let io_err = |source| DefenseError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        tracing::debug!(path = %path.display(), classes = self.len(), "mark archive written");
        Ok(())
    }

    pub fn load(path: &Path) -> DefenseResult<Self> {
        let bytes = fs::read(path).map_err(|source| DefenseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let (_, header) =
            SafeTensors::read_metadata(&bytes).map_err(|e| artifact_err(path, e.to_string()))?;
        let meta = header.metadata().clone().unwrap_or_default();
        let field = |key: &str| {
            meta.get(key)
                .cloned()
                .ok_or_else(|| artifact_err(path, format!("missing metadata {key:?}")))
        };
        let version = field("format_version")?;
        if version != FORMAT_VERSION {
            return Err(artifact_err(
                path,
                format!("unsupported format_version {version:?}"),
            ));
        }
        let target_class = field("target_class")?
            .parse::<i64>()
            .map_err(|e| artifact_err(path, format!("bad target_class: {e}")))?;

        let tensors =
            SafeTensors::deserialize(&bytes).map_err(|e| artifact_err(path, e.to_string()))?;
        let read = |key: &str| {
            let view = tensors
                .tensor(key)
                .map_err(|_| artifact_err(path, format!("missing tensor {key:?}")))?;
            if view.dtype() != Dtype::F32 {
                return Err(artifact_err(
                    path,
                    format!("{key:?} has dtype {:?}, expected F32", view.dtype()),
                ));
            }
            Ok((view.shape().to_vec(), from_bytes(view.data())))
        };
        let (mark_dims, mark_list) = read(MARK_KEY)?;
        let (loss_dims, loss_list) = read(LOSS_KEY)?;
        let mark_shape = match mark_dims.as_slice() {
            [n, c, h, w] if loss_dims.as_slice() == [*n] => [*c, *h, *w],
            _ => {
                return Err(artifact_err(
                    path,
                    format!("inconsistent shapes: {MARK_KEY} {mark_dims:?}, {LOSS_KEY} {loss_dims:?}"),
                ))
            }
        };
        Ok(Self {
            attack: field("attack")?,
            defense: field("defense")?,
            target_class,
            mark_shape,
            mark_list,
            loss_list,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(n: usize) -> MarkArchive {
        MarkArchive {
            attack: "badnet".into(),
            defense: "model_inspection".into(),
            target_class: 1,
            mark_shape: [2, 2, 2],
            mark_list: (0..n * 8).map(|v| v as f32 / 10.0).collect(),
            loss_list: (0..n).map(|v| v as f32).collect(),
        }
    }

    #[test]
    fn save_then_load_restores_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let path = archive_path(tmp.path(), "badnet", "model_inspection", 1);
        assert!(path.ends_with("badnet_model_inspection_tar1.safetensors"));
        let saved = archive(3);
        saved.save(&path).unwrap();
        // Overwriting with a longer sweep replaces the file.
        let longer = archive(4);
        longer.save(&path).unwrap();
        let loaded = MarkArchive::load(&path).unwrap();
        assert_eq!(loaded, longer);
        assert_eq!(loaded.mark(3).unwrap().len(), 8);
        assert!(loaded.mark(4).is_none());
    }

    #[test]
    fn missing_tensor_is_an_artifact_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("partial.safetensors");
        let bytes = to_bytes(&[1.0, 2.0]);
        let losses = TensorView::new(Dtype::F32, vec![2], &bytes).unwrap();
        let meta: HashMap<String, String> = [
            ("format_version", "1"),
            ("attack", "badnet"),
            ("defense", "x"),
            ("target_class", "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let data = safetensors::serialize(vec![(LOSS_KEY, &losses)], &Some(meta)).unwrap();
        fs::write(&path, data).unwrap();
        let err = MarkArchive::load(&path).unwrap_err();
        assert!(matches!(err, DefenseError::Artifact { .. }), "{err}");
    }

    #[test]
    fn mismatched_lengths_refuse_to_save() {
        let tmp = tempfile::tempdir().unwrap();
        let mut bad = archive(2);
        bad.loss_list.push(9.0);
        assert!(bad.save(&tmp.path().join("bad.safetensors")).is_err());
    }
}

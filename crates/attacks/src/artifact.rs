//! Trained attack state saved next to the model checkpoint.
//!
//! Layout: a safetensors file holding `mark` (`F32`, `[C + 1, H, W]`) and,
//! for TrojanNN, `neuron_idx` (`I64`, `[K]`), with string metadata
//! `format_version` and `attack`.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{AttackError, AttackResult};
use crate::watermark::Watermark;

pub const FORMAT_VERSION: &str = "1";
const MARK_KEY: &str = "mark";
const NEURON_KEY: &str = "neuron_idx";

#[derive(Debug, Clone, PartialEq)]
pub struct AttackArtifact {
    pub attack: String,
    pub mark_shape: [usize; 3],
    /// Channel-major `(C + 1, H, W)` mark.
    pub mark: Vec<f32>,
    pub neuron_idx: Option<Vec<usize>>,
}

fn artifact_err(path: &Path, msg: impl Into<String>) -> AttackError {
    AttackError::Artifact {
        path: path.to_path_buf(),
        msg: msg.into(),
    }
}

impl AttackArtifact {
    pub fn from_mark<B: Backend>(attack: &str, mark: &Watermark<B>) -> Self {
        let (mh, mw) = mark.mark_size();
        Self {
            attack: attack.to_string(),
            mark_shape: [mark.channels() + 1, mh, mw],
            mark: mark.pixels(),
            neuron_idx: None,
        }
    }

    pub fn mark_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(self.mark.clone(), self.mark_shape), device)
    }

    /// Write atomically through a temp file in the target directory.
    pub fn save(&self, path: &Path) -> AttackResult<()> {
        if self.mark.len() != self.mark_shape.iter().product::<usize>() {
            return Err(artifact_err(
                path,
                format!("{} mark values for shape {:?}", self.mark.len(), self.mark_shape),
            ));
        }
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let io_err = |source| AttackError::Io {
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_err)?;

        let ser = |e: safetensors::SafeTensorError| artifact_err(path, e.to_string());
        let mark_bytes: Vec<u8> = self.mark.iter().flat_map(|v| v.to_le_bytes()).collect();
        let neuron_bytes: Option<Vec<u8>> = self
            .neuron_idx
            .as_ref()
            .map(|idx| idx.iter().flat_map(|i| (*i as i64).to_le_bytes()).collect());
        let mark_view =
            TensorView::new(Dtype::F32, self.mark_shape.to_vec(), &mark_bytes).map_err(ser)?;
        let neuron_view = match &neuron_bytes {
            Some(bytes) => {
                Some(TensorView::new(Dtype::I64, vec![bytes.len() / 8], bytes).map_err(ser)?)
            }
            None => None,
        };
        let mut views = vec![(MARK_KEY, &mark_view)];
        if let Some(view) = &neuron_view {
            views.push((NEURON_KEY, view));
        }
        let metadata: HashMap<String, String> = HashMap::from([
            ("format_version".to_string(), FORMAT_VERSION.to_string()),
            ("attack".to_string(), self.attack.clone()),
        ]);
        let bytes = safetensors::serialize(views, &Some(metadata)).map_err(ser)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        tracing::debug!(path = %path.display(), attack = %self.attack, "attack artifact written");
        Ok(())
    }

    pub fn load(path: &Path) -> AttackResult<Self> {
        let bytes = fs::read(path).map_err(|source| AttackError::Io {
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
            return Err(artifact_err(path, format!("unsupported format_version {version:?}")));
        }

        let tensors =
            SafeTensors::deserialize(&bytes).map_err(|e| artifact_err(path, e.to_string()))?;
        let mark_view = tensors
            .tensor(MARK_KEY)
            .map_err(|_| artifact_err(path, format!("missing tensor {MARK_KEY:?}")))?;
        let mark_shape = match (mark_view.dtype(), mark_view.shape()) {
            (Dtype::F32, [c, h, w]) => [*c, *h, *w],
            (dtype, shape) => {
                return Err(artifact_err(
                    path,
                    format!("{MARK_KEY:?} is {dtype:?} {shape:?}, expected F32 [C + 1, H, W]"),
                ))
            }
        };
        let mark = mark_view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let neuron_idx = match tensors.tensor(NEURON_KEY) {
            Ok(view) if view.dtype() == Dtype::I64 => Some(
                view.data()
                    .chunks_exact(8)
                    .map(|b| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(b);
                        usize::try_from(i64::from_le_bytes(raw))
                            .map_err(|e| artifact_err(path, format!("bad neuron index: {e}")))
                    })
                    .collect::<AttackResult<Vec<usize>>>()?,
            ),
            Ok(view) => {
                return Err(artifact_err(
                    path,
                    format!("{NEURON_KEY:?} has dtype {:?}, expected I64", view.dtype()),
                ))
            }
            Err(_) => None,
        };
        Ok(Self {
            attack: field("attack")?,
            mark_shape,
            mark,
            neuron_idx,
        })
    }

    /// Refuse to restore another attack's state.
    pub fn check_attack(&self, attack: &str, path: &Path) -> AttackResult<()> {
        if self.attack != attack {
            return Err(artifact_err(
                path,
                format!("saved for {:?}, restoring into {attack:?}", self.attack),
            ));
        }
        Ok(())
    }
}

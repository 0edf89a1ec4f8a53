use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use std::path::Path;

use crate::{ModelError, ModelResult};

/// Write `model` next to `path` using full precision.
pub fn save_checkpoint<B: Backend, M: Module<B>, P: AsRef<Path>>(
    model: M,
    path: P,
) -> ModelResult<()> {
    let path = path.as_ref();
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .save_file(path.to_path_buf(), &recorder)
        .map_err(|e| ModelError::Recorder {
            path: path.display().to_string(),
            msg: e.to_string(),
        })
}

/// Load weights into an already-constructed `model` of matching shape.
pub fn load_checkpoint<B: Backend, M: Module<B>, P: AsRef<Path>>(
    model: M,
    path: P,
    device: &B::Device,
) -> ModelResult<M> {
    let path = path.as_ref();
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| ModelError::Recorder {
            path: path.display().to_string(),
            msg: e.to_string(),
        })
}

use crate::types::{DatasetError, DatasetResult, ImageSet};
use image::imageops::FilterType;
use std::fs;
use std::path::{Path, PathBuf};

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DatasetError + '_ {
    move |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn sorted_entries(dir: &Path) -> DatasetResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        out.push(entry.map_err(io_err(dir))?.path());
    }
    out.sort();
    Ok(out)
}

/// Load `root/<class>/<image>`; classes are numbered in sorted directory order.
///
/// Images are resized to `data_shape`'s `H x W` and converted to grayscale
/// (`C == 1`) or RGB (`C == 3`), scaled to `[0, 1]`. Returns the set and the
/// class names.
pub fn load_image_folder(root: &Path, data_shape: [usize; 3]) -> DatasetResult<(ImageSet, Vec<String>)> {
    let [c, h, w] = data_shape;
    if c != 1 && c != 3 {
        return Err(DatasetError::Other(format!(
            "image folders support 1 or 3 channels, got {c}"
        )));
    }
    let mut set = ImageSet::new(data_shape);
    let mut classes = Vec::new();
    let mut chw = vec![0.0f32; c * h * w];
    for class_dir in sorted_entries(root)?.into_iter().filter(|p| p.is_dir()) {
        let label = classes.len() as i64;
        classes.push(
            class_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        for path in sorted_entries(&class_dir)?.into_iter().filter(|p| p.is_file()) {
            let img = image::open(&path).map_err(|source| DatasetError::Image {
                path: path.clone(),
                source,
            })?;
            let img = img.resize_exact(w as u32, h as u32, FilterType::Triangle);
            if c == 1 {
                let luma = img.to_luma8();
                for (i, p) in luma.pixels().enumerate() {
                    chw[i] = p[0] as f32 / 255.0;
                }
            } else {
                let rgb = img.to_rgb8();
                for (i, p) in rgb.pixels().enumerate() {
                    for ch in 0..3 {
                        chw[ch * h * w + i] = p[ch] as f32 / 255.0;
                    }
                }
            }
            set.push(&chw, label)?;
        }
    }
    if set.is_empty() {
        tracing::warn!(root = %root.display(), "no images found in image folder");
    }
    Ok((set, classes))
}

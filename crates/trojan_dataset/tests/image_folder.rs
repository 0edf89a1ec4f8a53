use image::{Rgb, RgbImage};
use std::fs;
use trojan_dataset::{load_image_folder, BatchIter, LoaderConfig};

fn write_class(root: &std::path::Path, name: &str, count: usize, color: [u8; 3]) -> anyhow::Result<()> {
    let dir = root.join(name);
    fs::create_dir_all(&dir)?;
    for i in 0..count {
        let img = RgbImage::from_fn(6, 6, |_x, _y| Rgb(color));
        img.save(dir.join(format!("img_{i:03}.png")))?;
    }
    Ok(())
}

#[test]
fn folder_classes_are_sorted_and_resized() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_class(tmp.path(), "b_red", 2, [255, 0, 0])?;
    write_class(tmp.path(), "a_blue", 3, [0, 0, 255])?;

    let (set, classes) = load_image_folder(tmp.path(), [3, 4, 4])?;
    assert_eq!(classes, vec!["a_blue".to_string(), "b_red".to_string()]);
    assert_eq!(set.len(), 5);
    assert_eq!(set.labels(), &[0, 0, 0, 1, 1]);

    let first = set.input(0)?;
    // Blue lives in the third channel plane.
    assert!(first[..16].iter().all(|v| *v < 0.01));
    assert!(first[32..].iter().all(|v| *v > 0.99));

    let device = Default::default();
    let mut iter = BatchIter::new(&set, LoaderConfig::eval(4));
    let batch = iter
        .next_batch::<burn_ndarray::NdArray<f32>>(&device)?
        .expect("first batch");
    assert_eq!(batch.input.dims(), [4, 3, 4, 4]);
    Ok(())
}

#[test]
fn unsupported_channel_count_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    assert!(load_image_folder(tmp.path(), [2, 4, 4]).is_err());
}

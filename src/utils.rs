use anyhow::{Context, Result};
use burn::prelude::*;
use image::{GenericImage, Rgb, RgbImage};
use std::path::Path;

/// Map [-1, 1] normalized values back to [0, 255].
fn to_byte(value: f32) -> u8 {
    (((value + 1.0) * 0.5).clamp(0.0, 1.0) * 255.0) as u8
}

/// Convert a BCHW tensor in [-1, 1] to a vector of RGB images.
///
/// Single-channel tensors are rendered as grey.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 1 && channels != 3 {
        return Err(anyhow::anyhow!(
            "expected 1 or 3 channels for images, got {channels}"
        ));
    }

    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read tensor data as f32: {err:?}"))?;
    let hw = height * width;
    let plane = |c: usize| if channels == 1 { 0 } else { c * hw };

    let images = (0..batch)
        .map(|b| {
            let base = b * channels * hw;
            RgbImage::from_fn(width as u32, height as u32, |x, y| {
                let idx = base + y as usize * width + x as usize;
                Rgb([
                    to_byte(values[idx + plane(0)]),
                    to_byte(values[idx + plane(1)]),
                    to_byte(values[idx + plane(2)]),
                ])
            })
        })
        .collect();
    Ok(images)
}

/// Stack images vertically, then place the columns side by side.
pub fn merge_columns(columns: &[Vec<RgbImage>]) -> Result<RgbImage> {
    let first = columns
        .first()
        .and_then(|column| column.first())
        .ok_or_else(|| anyhow::anyhow!("no images to merge"))?;
    let (width, height) = first.dimensions();
    let rows = columns.iter().map(Vec::len).max().unwrap_or(0) as u32;
    let mut out = RgbImage::new(width * columns.len() as u32, height * rows);

    for (col, column) in columns.iter().enumerate() {
        for (row, img) in column.iter().enumerate() {
            out.copy_from(img, col as u32 * width, row as u32 * height)
                .context("failed to copy image into grid")?;
        }
    }
    Ok(out)
}

/// Save a `[real_A | fake_B | real_B]` grid, one row per sample.
pub fn save_sample_grid<B: Backend>(
    real_a: Tensor<B, 4>,
    fake_b: Tensor<B, 4>,
    real_b: Tensor<B, 4>,
    path: &Path,
) -> Result<()> {
    let columns = vec![
        tensor_to_images(real_a)?,
        tensor_to_images(fake_b)?,
        tensor_to_images(real_b)?,
    ];
    let grid = merge_columns(&columns)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    grid.save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

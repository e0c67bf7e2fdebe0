use anyhow::{Context, Result};
use image_hasher::{HashAlg, HasherConfig, ImageHash};

/// Perceptual hash of an encoded frame (any format `image` can sniff).
pub fn compute_phash(frame_bytes: &[u8]) -> Result<String> {
    let img = image::load_from_memory(frame_bytes).context("failed to decode captured frame")?;
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();

    Ok(hasher.hash_image(&img).to_base64())
}

/// `u32::MAX` when either hash is unreadable, so callers treat it as changed.
pub fn compute_hamming_distance(lhs: &str, rhs: &str) -> u32 {
    let Ok(h1) = ImageHash::<Vec<u8>>::from_base64(lhs) else {
        return u32::MAX;
    };
    let Ok(h2) = ImageHash::<Vec<u8>>::from_base64(rhs) else {
        return u32::MAX;
    };
    h1.dist(&h2)
}

#[cfg(test)]
pub(crate) fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    let img = ImageBuffer::from_fn(width, height, |_, _| Rgb(rgb));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

#[cfg(test)]
pub(crate) fn striped_png(width: u32, height: u32) -> Vec<u8> {
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    let img = ImageBuffer::from_fn(width, height, |x, y| {
        if (x / 4 + y / 4) % 2 == 0 {
            Rgb([250u8, 250, 250])
        } else {
            Rgb([5u8, 5, 5])
        }
    });
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

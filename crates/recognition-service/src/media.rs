//! Image helpers for previews, thumbnails and annotated frames, plus the
//! on-disk store they are written to.

use anyhow::{bail, Context, Result};
use common::events::BoundingBox;
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage, Rgb};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use std::path::{Component, Path, PathBuf};

pub const PREVIEW_JPEG_QUALITY: u8 = 85;
pub const THUMBNAIL_SIZE: u32 = 200;
pub const THUMBNAIL_PADDING: i32 = 20;
pub const THUMBNAIL_JPEG_QUALITY: u8 = 95;
pub const FULL_FRAME_MAX_SIDE: u32 = 400;
pub const FULL_FRAME_JPEG_QUALITY: u8 = 90;

const MATCH_COLOR: Rgb<u8> = Rgb([0, 200, 0]);

/// Downscale so the width is at most `max_width`, keeping aspect ratio
pub fn resize_max_width(img: &DynamicImage, max_width: u32) -> DynamicImage {
    if max_width == 0 || img.width() <= max_width {
        return img.clone();
    }
    let height = (u64::from(img.height()) * u64::from(max_width) / u64::from(img.width())).max(1);
    img.resize_exact(max_width, height as u32, FilterType::Triangle)
}

/// Downscale so the longest side is at most `max_side`
pub fn resize_max_side(img: &DynamicImage, max_side: u32) -> DynamicImage {
    if img.width().max(img.height()) <= max_side {
        return img.clone();
    }
    img.resize(max_side, max_side, FilterType::Triangle)
}

pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(&rgb)
        .context("failed to encode jpeg")?;
    Ok(buf)
}

/// Crop `bbox` grown by `padding` on every side and clamped to the frame.
/// Returns `None` when nothing of the box lies inside the frame.
pub fn crop_face(img: &DynamicImage, bbox: &BoundingBox, padding: i32) -> Option<DynamicImage> {
    let max_x = img.width() as i32;
    let max_y = img.height() as i32;
    let x1 = (bbox.x1 - padding).clamp(0, max_x);
    let y1 = (bbox.y1 - padding).clamp(0, max_y);
    let x2 = (bbox.x2 + padding).clamp(0, max_x);
    let y2 = (bbox.y2 + padding).clamp(0, max_y);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(img.crop_imm(x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
}

/// Padded, square-resized face crop as JPEG
pub fn thumbnail_jpeg(img: &DynamicImage, bbox: &BoundingBox) -> Result<Option<Vec<u8>>> {
    let Some(crop) = crop_face(img, bbox, THUMBNAIL_PADDING) else {
        return Ok(None);
    };
    let thumb = crop.resize_exact(THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Triangle);
    encode_jpeg(&thumb, THUMBNAIL_JPEG_QUALITY).map(Some)
}

/// Draw a 2px box around the face
pub fn annotate(img: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    let mut canvas = img.to_rgb8();
    for inset in 0..2 {
        let width = bbox.width() - 2 * inset;
        let height = bbox.height() - 2 * inset;
        if width <= 0 || height <= 0 {
            break;
        }
        let rect = Rect::at(bbox.x1 + inset, bbox.y1 + inset).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(&mut canvas, rect, MATCH_COLOR);
    }
    DynamicImage::ImageRgb8(canvas)
}

/// Annotated, downscaled copy of the whole frame as JPEG
pub fn full_frame_jpeg(img: &DynamicImage, bbox: &BoundingBox) -> Result<Vec<u8>> {
    let annotated = annotate(img, bbox);
    encode_jpeg(
        &resize_max_side(&annotated, FULL_FRAME_MAX_SIDE),
        FULL_FRAME_JPEG_QUALITY,
    )
}

/// Writes event images under a data directory and hands back paths relative to it
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn save_thumbnail(&self, camera_id: &str, ts: i64, index: usize, jpeg: &[u8]) -> Result<String> {
        self.save("thumbs", camera_id, ts, index, jpeg).await
    }

    pub async fn save_frame(&self, camera_id: &str, ts: i64, index: usize, jpeg: &[u8]) -> Result<String> {
        self.save("frames", camera_id, ts, index, jpeg).await
    }

    /// Read back a file saved by this store; `None` if it no longer exists
    pub async fn read(&self, relpath: &str) -> Result<Option<Vec<u8>>> {
        let relative = Path::new(relpath);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            bail!("media path must stay inside the data directory: {}", relpath);
        }
        match tokio::fs::read(self.root.join(relative)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("failed to read {}", relpath))),
        }
    }

    async fn save(&self, kind: &str, camera_id: &str, ts: i64, index: usize, jpeg: &[u8]) -> Result<String> {
        common::validation::validate_id(camera_id, "camera_id")?;
        let relpath = format!("{}/{}/{}_{}.jpg", kind, camera_id, ts, index);
        let path = self.root.join(&relpath);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, jpeg)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(relpath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_pixel(w, h, Rgb([10, 20, 30])))
    }

    #[test]
    fn test_resize_max_width() {
        let small = resize_max_width(&frame(640, 480), 1280);
        assert_eq!((small.width(), small.height()), (640, 480));

        let big = resize_max_width(&frame(2560, 1440), 1280);
        assert_eq!((big.width(), big.height()), (1280, 720));
    }

    #[test]
    fn test_crop_face_clamps_padding() {
        let img = frame(100, 100);
        let crop = crop_face(&img, &BoundingBox::new(5, 5, 50, 50), 20).unwrap();
        assert_eq!((crop.width(), crop.height()), (70, 70));
        assert!(crop_face(&img, &BoundingBox::new(200, 200, 300, 300), 0).is_none());
    }

    #[test]
    fn test_thumbnail_is_decodable_square() {
        let jpeg = thumbnail_jpeg(&frame(320, 240), &BoundingBox::new(100, 60, 180, 160))
            .unwrap()
            .unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (THUMBNAIL_SIZE, THUMBNAIL_SIZE));
    }

    #[test]
    fn test_annotate_draws_border() {
        let annotated = annotate(&frame(50, 50), &BoundingBox::new(10, 10, 40, 40)).to_rgb8();
        assert_eq!(*annotated.get_pixel(10, 20), MATCH_COLOR);
        assert_eq!(*annotated.get_pixel(25, 25), Rgb([10, 20, 30]));
    }

    #[tokio::test]
    async fn test_media_store_writes_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path());
        let rel = store.save_thumbnail("cam-1", 1234, 0, b"jpeg").await.unwrap();
        assert_eq!(rel, "thumbs/cam-1/1234_0.jpg");
        assert_eq!(std::fs::read(dir.path().join(&rel)).unwrap(), b"jpeg");

        assert!(store.save_frame("../escape", 1, 0, b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_media_store_reads_back_inside_root_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("media"));
        let rel = store.save_frame("cam-1", 7, 0, b"frame").await.unwrap();

        assert_eq!(store.read(&rel).await.unwrap().unwrap(), b"frame");
        assert!(store.read("frames/cam-1/8_0.jpg").await.unwrap().is_none());
        assert!(store.read("../media/frames/cam-1/7_0.jpg").await.is_err());
        assert!(store.read("/etc/passwd").await.is_err());
    }
}

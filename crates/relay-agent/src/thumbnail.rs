use std::{io::Cursor, time::Duration};

use anyhow::Context;
use image::codecs::jpeg::JpegEncoder;

use crate::messenger::Thumbnail;

pub const THUMBNAIL_EDGE: u32 = 150;
const JPEG_QUALITY: u8 = 80;
const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Fits the image inside 150x150 (aspect kept) and re-encodes it as JPEG.
pub fn make_thumbnail(bytes: &[u8]) -> anyhow::Result<Thumbnail> {
    let img = image::load_from_memory(bytes).context("decode artwork")?;
    let small = img.thumbnail(THUMBNAIL_EDGE, THUMBNAIL_EDGE);
    let rgb = small.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(rgb)
        .write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))
        .context("encode thumbnail")?;

    Ok(Thumbnail {
        jpeg: out.into_inner(),
        width,
        height,
    })
}

#[async_trait::async_trait]
pub trait ThumbnailSource: Send + Sync {
    async fn thumbnail(&self, artwork_url: &str) -> anyhow::Result<Thumbnail>;
}

#[derive(Clone)]
pub struct HttpThumbnails {
    http: reqwest::Client,
}

impl HttpThumbnails {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait::async_trait]
impl ThumbnailSource for HttpThumbnails {
    async fn thumbnail(&self, artwork_url: &str) -> anyhow::Result<Thumbnail> {
        let bytes = self
            .http
            .get(artwork_url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("fetch artwork {artwork_url}"))?
            .bytes()
            .await
            .context("read artwork body")?;

        tokio::task::spawn_blocking(move || make_thumbnail(&bytes))
            .await
            .context("thumbnail task")?
    }
}

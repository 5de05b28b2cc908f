use anyhow::{Context, Result};
use chrono::Local;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use log::{info, warn};
use rand::Rng;
use rusttype::{Font, Scale};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::fetch::{download, FetchOptions};
use crate::yolo_result::Bbox;

const FONT_URL: &str = "https://ultralytics.com/assets/Arial.ttf";
const FONT_NAME: &str = "Arial.ttf";
const FONT_TIMEOUT: Duration = Duration::from_secs(10);

/// Draws detections onto a copy of the image and saves it as JPEG.
pub struct Annotator {
    save_dir: PathBuf,
    font: Option<Font<'static>>,
    colors: Vec<Rgb<u8>>,
}

impl Annotator {
    pub fn new<P: AsRef<Path>>(save_dir: P, nc: usize) -> Result<Self> {
        let save_dir = save_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&save_dir)
            .with_context(|| format!("Failed to create '{}'", save_dir.display()))?;
        Ok(Self {
            save_dir,
            font: shared_font(),
            colors: random_colors(nc),
        })
    }

    fn color(&mut self, id: usize) -> Rgb<u8> {
        if id >= self.colors.len() {
            let extra = random_colors(id + 1 - self.colors.len());
            self.colors.extend(extra);
        }
        self.colors[id]
    }

    pub fn draw(&mut self, image: &DynamicImage, boxes: &[Bbox], names: &[String]) -> RgbImage {
        let mut canvas = image.to_rgb8();
        let (w, h) = canvas.dimensions();
        let thickness = ((w.max(h) as f32 / 600.).round() as i32).max(1);
        for bbox in boxes {
            let color = self.color(bbox.id());
            let (x, y) = (bbox.xmin().round() as i32, bbox.ymin().round() as i32);
            let bw = bbox.width().round().max(1.) as u32;
            let bh = bbox.height().round().max(1.) as u32;
            for t in 0..thickness {
                let side = 2 * t as u32;
                draw_hollow_rect_mut(
                    &mut canvas,
                    Rect::at(x - t, y - t).of_size(bw + side, bh + side),
                    color,
                );
            }

            let Some(font) = &self.font else { continue };
            let label = match names.get(bbox.id()) {
                Some(name) => format!("{name} {:.2}", bbox.confidence()),
                None => format!("{} {:.2}", bbox.id(), bbox.confidence()),
            };
            let size = (w.max(h) as f32 / 40.).max(12.);
            let scale = Scale::uniform(size);
            let text_w = (label.len() as f32 * size * 0.55).ceil() as u32;
            let text_y = (y - size as i32).max(0);
            draw_filled_rect_mut(
                &mut canvas,
                Rect::at(x, text_y).of_size(text_w.max(1), size as u32),
                color,
            );
            draw_text_mut(
                &mut canvas,
                Rgb([255, 255, 255]),
                x,
                text_y,
                scale,
                font,
                &label,
            );
        }
        canvas
    }

    /// Saves to `<save_dir>/<timestamp>_<tag>.jpg` and returns the path.
    pub fn save(
        &mut self,
        image: &DynamicImage,
        boxes: &[Bbox],
        names: &[String],
        tag: &str,
    ) -> Result<PathBuf> {
        let canvas = self.draw(image, boxes, names);
        let stamp = Local::now().format("%Y-%m-%d-%H-%M-%S-%f");
        let tag: String = tag
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = self.save_dir.join(format!("{stamp}_{tag}.jpg"));
        canvas
            .save(&path)
            .with_context(|| format!("Failed to save '{}'", path.display()))?;
        info!("Annotated image saved to '{}'", path.display());
        Ok(path)
    }
}

fn random_colors(n: usize) -> Vec<Rgb<u8>> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| Rgb([rng.gen_range(0..=255), rng.gen_range(0..=255), rng.gen_range(0..=255)]))
        .collect()
}

fn shared_font() -> Option<Font<'static>> {
    static FONT: OnceLock<Option<Font<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match load_font() {
        Ok(font) => Some(font),
        Err(e) => {
            warn!("No font for labels, drawing boxes only: {e:#}");
            None
        }
    })
    .clone()
}

/// Reads the label font from the config dir, downloading it on first use.
fn load_font() -> Result<Font<'static>> {
    let dir = dirs::config_dir()
        .context("No config directory on this platform")?
        .join("snapi");
    let options = FetchOptions {
        timeout: FONT_TIMEOUT,
        ..Default::default()
    };
    load_font_from(FONT_URL, &dir, &options)
}

fn load_font_from(url: &str, dir: &Path, options: &FetchOptions) -> Result<Font<'static>> {
    let path = dir.join(FONT_NAME);
    if !path.exists() {
        info!("Downloading {url} to '{}'", path.display());
        let bytes = download(url, options)?;
        std::fs::create_dir_all(dir)?;
        std::fs::write(&path, &bytes)?;
    }
    let bytes = std::fs::read(&path)?;
    Font::try_from_vec(bytes).context("Invalid font file")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use warp::Filter;

    fn annotator(dir: &Path) -> Annotator {
        Annotator {
            save_dir: dir.to_path_buf(),
            font: None,
            colors: vec![Rgb([255, 0, 0])],
        }
    }

    #[test]
    fn boxes_are_drawn() {
        let dir = std::env::temp_dir();
        let image = DynamicImage::ImageRgb8(RgbImage::new(50, 50));
        let boxes = [Bbox::new(10., 10., 30., 30., 0, 0.9)];
        let canvas = annotator(&dir).draw(&image, &boxes, &["hand".to_string()]);
        assert_eq!(canvas.get_pixel(10, 10), &Rgb([255, 0, 0]));
        assert_eq!(canvas.get_pixel(20, 20), &Rgb([0, 0, 0]));
    }

    #[test]
    fn unknown_classes_get_colors() {
        let mut a = annotator(&std::env::temp_dir());
        let _ = a.color(4);
        assert_eq!(a.colors.len(), 5);
    }

    #[test]
    fn saves_jpeg_with_sanitized_tag() {
        let dir = std::env::temp_dir().join(format!("snapi-annotate-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::new(20, 20));
        let path = annotator(&dir)
            .save(&image, &[], &[], "0_user/../x")
            .unwrap();
        assert!(path.exists());
        assert_eq!(path.parent(), Some(dir.as_path()));
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with("_0_user____x.jpg"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn stalled_font_download_times_out() {
        let slow = warp::path("font.ttf").and_then(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, warp::Rejection>("late")
        });
        let (addr, server) = warp::serve(slow).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let dir = std::env::temp_dir().join(format!("snapi-font-{}", std::process::id()));
        let url = format!("http://{addr}/font.ttf");
        let options = FetchOptions {
            timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let started = Instant::now();
        let result = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || load_font_from(&url, &dir, &options))
                .await
                .unwrap()
        };
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!dir.join(FONT_NAME).exists());
    }
}

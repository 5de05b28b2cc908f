use image::DynamicImage;
use std::fmt;
use std::io::Read;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub max_bytes: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
pub enum FetchError {
    /// The server answered with something other than 200.
    Status(u16),
    Transport(String),
    TooLarge(u64),
    Decode(image::ImageError),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Status(code) => write!(f, "unexpected status code {code}"),
            FetchError::Transport(e) => write!(f, "image download failed: {e}"),
            FetchError::TooLarge(limit) => write!(f, "image is larger than {limit} bytes"),
            FetchError::Decode(e) => write!(f, "cannot identify image file: {e}"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

/// Downloads raw bytes. Blocking; call it from the blocking pool.
pub fn download(url: &str, options: &FetchOptions) -> Result<Vec<u8>, FetchError> {
    let agent = ureq::AgentBuilder::new().timeout(options.timeout).build();
    let resp = match agent.get(url).call() {
        Ok(resp) => resp,
        Err(ureq::Error::Status(code, _)) => return Err(FetchError::Status(code)),
        Err(e) => return Err(FetchError::Transport(e.to_string())),
    };
    if resp.status() != 200 {
        return Err(FetchError::Status(resp.status()));
    }

    let mut bytes = Vec::new();
    resp.into_reader()
        .take(options.max_bytes + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| FetchError::Transport(e.to_string()))?;
    if bytes.len() as u64 > options.max_bytes {
        return Err(FetchError::TooLarge(options.max_bytes));
    }
    Ok(bytes)
}

/// Decodes downloaded bytes into an RGB image.
pub fn decode_rgb(bytes: &[u8]) -> Result<DynamicImage, FetchError> {
    let image = image::load_from_memory(bytes).map_err(FetchError::Decode)?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

pub fn fetch_image(url: &str, options: &FetchOptions) -> Result<DynamicImage, FetchError> {
    let bytes = download(url, options)?;
    decode_rgb(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;
    use warp::Filter;

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 3, Rgba([10, 20, 30, 255])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageOutputFormat::Png).unwrap();
        buf.into_inner()
    }

    async fn serve() -> std::net::SocketAddr {
        let png = png_bytes();
        let image = warp::path("image.png").map(move || png.clone());
        let missing = warp::path("missing").map(|| {
            warp::reply::with_status("gone", warp::http::StatusCode::NOT_FOUND)
        });
        let junk = warp::path("junk").map(|| "not an image");
        let (addr, server) =
            warp::serve(image.or(missing).or(junk)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    async fn fetch(url: String, options: FetchOptions) -> Result<DynamicImage, FetchError> {
        tokio::task::spawn_blocking(move || fetch_image(&url, &options))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn downloads_and_converts_to_rgb() {
        let addr = serve().await;
        let image = fetch(format!("http://{addr}/image.png"), FetchOptions::default())
            .await
            .unwrap();
        let rgb = image.as_rgb8().unwrap();
        assert_eq!(rgb.dimensions(), (4, 3));
        assert_eq!(rgb.get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[tokio::test]
    async fn status_is_reported() {
        let addr = serve().await;
        let err = fetch(format!("http://{addr}/missing"), FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(404)));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let addr = serve().await;
        let options = FetchOptions {
            max_bytes: 8,
            ..Default::default()
        };
        let err = fetch(format!("http://{addr}/image.png"), options)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge(8)));
    }

    #[tokio::test]
    async fn undecodable_body_is_rejected() {
        let addr = serve().await;
        let err = fetch(format!("http://{addr}/junk"), FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[test]
    fn decodes_gif_and_bmp() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(5, 4, Rgb([0, 0, 255])));
        for format in [ImageOutputFormat::Gif, ImageOutputFormat::Bmp] {
            let mut buf = Cursor::new(Vec::new());
            img.write_to(&mut buf, format.clone()).unwrap();
            let decoded = decode_rgb(buf.get_ref()).unwrap();
            let rgb = decoded.as_rgb8().unwrap();
            assert_eq!(rgb.dimensions(), (5, 4), "{format:?}");
            let [r, g, b] = rgb.get_pixel(2, 2).0;
            assert!(r < 16 && g < 16 && b > 240, "{format:?}: {:?}", [r, g, b]);
        }
    }

    #[test]
    fn unreachable_host_is_transport_error() {
        let options = FetchOptions {
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let err = download("http://127.0.0.1:1/image.png", &options).unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
    }
}

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

pub mod annotate;
pub mod config;
pub mod fetch;
pub mod mission;
pub mod model;
pub mod ort_backend;
pub mod registry;
pub mod server;
pub mod yolo_result;

pub use crate::config::{ChallengeConfig, ModelsConfig};
pub use crate::model::{Detector, DetectorConfig, YOLO};
pub use crate::registry::ModelRegistry;
pub use crate::yolo_result::Bbox;

pub const DEFAULT_CONFIG_FILE: &str = "./models/models_configs.json";

#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "Mission object detection server")]
pub struct Args {
    /// Challenge configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Confidence threshold
    #[arg(long, default_value_t = 0.25)]
    pub conf: f32,

    /// IoU threshold for non-max suppression
    #[arg(long, default_value_t = 0.45)]
    pub iou: f32,

    /// Maximum detections kept per image
    #[arg(long, default_value_t = 300)]
    pub max_det: usize,

    /// Run inference with the CUDA execution provider
    #[arg(long)]
    pub cuda: bool,

    #[arg(long, default_value_t = 0)]
    pub device_id: u32,

    /// Intra-op threads per model session
    #[arg(long, default_value_t = 1)]
    pub threads: i16,

    /// Image download timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub download_timeout: u64,

    #[arg(long, default_value_t = 20 * 1024 * 1024)]
    pub max_image_bytes: u64,

    /// Write annotated detection images into this directory
    #[arg(long)]
    pub save_dir: Option<PathBuf>,
}

impl Args {
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            conf: self.conf,
            iou: self.iou,
            max_det: self.max_det,
            cuda: self.cuda,
            device_id: self.device_id,
            threads: self.threads,
        }
    }

    pub fn fetch_options(&self) -> fetch::FetchOptions {
        fetch::FetchOptions {
            timeout: std::time::Duration::from_secs(self.download_timeout),
            max_bytes: self.max_image_bytes,
        }
    }
}

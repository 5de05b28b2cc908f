use anyhow::Result;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use log::{info, warn};
use ndarray::{s, Array, ArrayView2, Axis, IxDyn};
use regex::Regex;
use std::path::Path;

use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};
use crate::yolo_result::{non_max_suppression, Bbox};

/// Letterbox fill value for the area outside the resized image.
const PAD_VALUE: f32 = 144.0 / 255.0;

/// Anything that turns an image into class-labelled boxes.
pub trait Detector: Send {
    /// Class names indexed by class id.
    fn names(&self) -> &[String];

    /// Detections sorted by confidence, highest first.
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Bbox>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub conf: f32,
    pub iou: f32,
    pub max_det: usize,
    pub cuda: bool,
    pub device_id: u32,
    pub threads: i16,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            conf: 0.25,
            iou: 0.45,
            max_det: 300,
            cuda: false,
            device_id: 0,
            threads: 1,
        }
    }
}

pub struct YOLO {
    engine: OrtBackend,
    names: Vec<String>,
    conf: f32,
    iou: f32,
    max_det: usize,
}

impl YOLO {
    pub fn new<P: AsRef<Path>>(
        f: P,
        config: &DetectorConfig,
        names_override: Option<&[String]>,
    ) -> Result<Self> {
        let ep = if config.cuda {
            OrtEP::Cuda(config.device_id)
        } else {
            OrtEP::Cpu
        };
        let engine = OrtBackend::build(OrtConfig {
            f: f.as_ref().to_path_buf(),
            ep,
            threads: config.threads,
        })?;

        let names = match engine.fetch_from_metadata("names") {
            Some(raw) => parse_names(&raw)?,
            None => Vec::new(),
        };
        let names = match names_override {
            Some(custom) if names.is_empty() => custom.to_vec(),
            Some(custom) => {
                if custom != names.as_slice() {
                    warn!("Model carries its own class names, ignoring configured names");
                }
                names
            }
            None => names,
        };
        if names.is_empty() {
            warn!(
                "No class names for '{}', classes will be reported as class_<id>",
                f.as_ref().display()
            );
        }
        info!(
            "Loaded '{}' with {} classes{}",
            f.as_ref().display(),
            names.len(),
            if engine.is_fp16() { " (fp16)" } else { "" }
        );

        Ok(Self {
            engine,
            names,
            conf: config.conf,
            iou: config.iou,
            max_det: config.max_det,
        })
    }

    pub fn preprocess(&self, image: &DynamicImage) -> (Array<f32, IxDyn>, f32) {
        letterbox(image, self.engine.width(), self.engine.height())
    }

    fn ensure_names(&mut self, nc: usize) {
        for id in self.names.len()..nc {
            self.names.push(format!("class_{id}"));
        }
    }
}

impl Detector for YOLO {
    fn names(&self) -> &[String] {
        &self.names
    }

    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Bbox>> {
        let (xs, ratio) = self.preprocess(image);
        let ys = self.engine.run(xs)?;
        let preds = ys
            .first()
            .ok_or_else(|| anyhow::anyhow!("Model produced no outputs"))?;
        let preds = match preds.shape() {
            [1, a, b] => preds
                .view()
                .into_shape((*a, *b))?
                .to_owned(),
            shape => anyhow::bail!("Unexpected output shape {shape:?}"),
        };
        let (w0, h0) = image.dimensions();
        let boxes = postprocess(
            preds.view(),
            ratio,
            (w0 as f32, h0 as f32),
            self.conf,
            self.iou,
            self.max_det,
        )?;
        if let Some(max_id) = boxes.iter().map(Bbox::id).max() {
            self.ensure_names(max_id + 1);
        }
        Ok(boxes)
    }
}

/// Resizes keeping the aspect ratio into a `width x height` canvas anchored
/// at the top-left corner. Returns the NCHW tensor and the scale applied.
pub fn letterbox(image: &DynamicImage, width: u32, height: u32) -> (Array<f32, IxDyn>, f32) {
    let (w0, h0) = image.dimensions();
    let ratio = (width as f32 / w0 as f32).min(height as f32 / h0 as f32);
    let w_new = ((w0 as f32 * ratio).round() as u32).clamp(1, width);
    let h_new = ((h0 as f32 * ratio).round() as u32).clamp(1, height);
    let resized = image
        .resize_exact(w_new, h_new, FilterType::Triangle)
        .to_rgb8();

    let mut xs = Array::from_elem(
        IxDyn(&[1, 3, height as usize, width as usize]),
        PAD_VALUE,
    );
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        xs[[0, 0, y, x]] = r as f32 / 255.0;
        xs[[0, 1, y, x]] = g as f32 / 255.0;
        xs[[0, 2, y, x]] = b as f32 / 255.0;
    }
    (xs, ratio)
}

/// Decodes a single-image detection head.
///
/// Accepts `[4 + nc, anchors]` as exported by Ultralytics and the transposed
/// `[anchors, 4 + nc]`. Rows are `cx, cy, w, h` followed by class scores in
/// letterboxed pixels.
pub fn postprocess(
    preds: ArrayView2<f32>,
    ratio: f32,
    (w0, h0): (f32, f32),
    conf: f32,
    iou: f32,
    max_det: usize,
) -> Result<Vec<Bbox>> {
    let preds = if preds.nrows() <= preds.ncols() {
        preds
    } else {
        preds.reversed_axes()
    };
    if preds.nrows() <= 4 {
        anyhow::bail!("Detection head has {} rows, expected 4 + classes", preds.nrows());
    }

    let mut boxes = Vec::new();
    for anchor in preds.axis_iter(Axis(1)) {
        let scores = anchor.slice(s![4..]);
        let (id, &score) = match scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        {
            Some(best) => best,
            None => continue,
        };
        if score < conf {
            continue;
        }
        let (cx, cy, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
        let bbox = Bbox::new(
            (cx - w / 2.) / ratio,
            (cy - h / 2.) / ratio,
            (cx + w / 2.) / ratio,
            (cy + h / 2.) / ratio,
            id,
            score,
        )
        .clamp(w0, h0);
        boxes.push(bbox);
    }

    let mut boxes = non_max_suppression(boxes, iou);
    boxes.truncate(max_det);
    Ok(boxes)
}

/// Parses the `names` metadata written by Ultralytics exports, a Python dict
/// literal such as `{0: 'person', 1: "bus"}`.
pub fn parse_names(raw: &str) -> Result<Vec<String>> {
    let re = Regex::new(r#"(\d+)\s*:\s*(?:'([^']*)'|"([^"]*)")"#)?;
    let mut pairs: Vec<(usize, String)> = re
        .captures_iter(raw)
        .filter_map(|cap| {
            let id = cap.get(1)?.as_str().parse().ok()?;
            let name = cap.get(2).or_else(|| cap.get(3))?.as_str().to_string();
            Some((id, name))
        })
        .collect();
    pairs.sort_by_key(|(id, _)| *id);

    let mut names = Vec::with_capacity(pairs.len());
    for (id, name) in pairs {
        while names.len() < id {
            names.push(format!("class_{}", names.len()));
        }
        names.push(name);
    }
    Ok(names)
}

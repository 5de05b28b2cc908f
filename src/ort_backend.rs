use anyhow::{Context, Result};
use half::f16;
use log::{info, warn};
use ndarray::{Array, CowArray, IxDyn};
use ort::{
    execution_providers::CUDAExecutionProviderOptions, tensor::TensorElementDataType,
    Environment, ExecutionProvider, GraphOptimizationLevel, Session, SessionBuilder, Value,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Input size used when the model declares dynamic height/width.
pub const DEFAULT_INPUT_SIZE: u32 = 640;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    Cpu,
    Cuda(u32),
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub f: PathBuf,
    pub ep: OrtEP,
    pub threads: i16,
}

pub struct OrtBackend {
    session: Session,
    dtype: TensorElementDataType,
    height: u32,
    width: u32,
}

impl OrtBackend {
    pub fn build(config: OrtConfig) -> Result<Self> {
        let env = Environment::builder()
            .with_name("snapi")
            .build()?
            .into_arc();
        let ep = Self::resolve_ep(config.ep);
        let session = Self::session(&env, &config.f, ep, config.threads)
            .with_context(|| format!("Failed to load model '{}'", config.f.display()))?;

        let input = session
            .inputs
            .first()
            .context("Model declares no inputs")?;
        let dtype = input.input_type;
        let dims: Vec<Option<u32>> = input
            .dimensions
            .iter()
            .map(|d| d.map(|x| x as u32))
            .collect();
        let (height, width) = match dims.as_slice() {
            [_, _, h, w] => (
                h.unwrap_or(DEFAULT_INPUT_SIZE),
                w.unwrap_or(DEFAULT_INPUT_SIZE),
            ),
            _ => anyhow::bail!("Expected an NCHW image input, got {} dims", dims.len()),
        };
        match dtype {
            TensorElementDataType::Float32 | TensorElementDataType::Float16 => {}
            other => anyhow::bail!("Unsupported input type {other:?}"),
        }
        info!(
            "Model '{}': input {}x{} {:?} on {:?}",
            config.f.display(),
            height,
            width,
            dtype,
            ep
        );

        Ok(Self {
            session,
            dtype,
            height,
            width,
        })
    }

    fn resolve_ep(ep: OrtEP) -> OrtEP {
        match ep {
            OrtEP::Cuda(id) if !ExecutionProvider::CUDA(Default::default()).is_available() => {
                warn!("CUDA is not available, device {id} ignored. Using CPU.");
                OrtEP::Cpu
            }
            ep => ep,
        }
    }

    fn session(env: &Arc<Environment>, f: &Path, ep: OrtEP, threads: i16) -> Result<Session> {
        let provider = match ep {
            OrtEP::Cpu => ExecutionProvider::CPU(Default::default()),
            OrtEP::Cuda(device_id) => ExecutionProvider::CUDA(CUDAExecutionProviderOptions {
                device_id: device_id as _,
                ..Default::default()
            }),
        };
        let session = SessionBuilder::new(env)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(threads)?
            .with_execution_providers([provider])?
            .with_model_from_file(f)?;
        Ok(session)
    }

    /// Runs one NCHW batch and returns every output as f32.
    pub fn run(&self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        match self.dtype {
            TensorElementDataType::Float16 => {
                let xs = CowArray::from(xs.mapv(f16::from_f32));
                let ys = self
                    .session
                    .run(vec![Value::from_array(self.session.allocator(), &xs)?])?;
                ys.iter()
                    .map(|y| {
                        let t = y.try_extract::<f16>()?;
                        let owned = t.view().mapv(f16::to_f32);
                        Ok::<_, anyhow::Error>(owned)
                    })
                    .collect()
            }
            _ => {
                let xs = CowArray::from(xs);
                let ys = self
                    .session
                    .run(vec![Value::from_array(self.session.allocator(), &xs)?])?;
                ys.iter()
                    .map(|y| {
                        let t = y.try_extract::<f32>()?;
                        let owned = t.view().to_owned();
                        Ok::<_, anyhow::Error>(owned)
                    })
                    .collect()
            }
        }
    }

    pub fn fetch_from_metadata(&self, key: &str) -> Option<String> {
        match self.session.metadata() {
            Err(_) => None,
            Ok(metadata) => metadata.custom(key).unwrap_or_default(),
        }
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn is_fp16(&self) -> bool {
        matches!(self.dtype, TensorElementDataType::Float16)
    }
}

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use image::DynamicImage;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::error::AppError;

/// An immutable embedding vector. Cloning shares the underlying buffer.
#[derive(Clone, PartialEq)]
pub struct Embedding(Arc<[f32]>);

impl Embedding {
    /// Borrow the values.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values.into())
    }
}

impl Deref for Embedding {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding").field("len", &self.0.len()).finish()
    }
}

/// An image-to-vector model.
///
/// `embed` is synchronous and may be slow; callers run it off the async
/// executor. Vectors from one model instance must all have the same length.
pub trait VisionModel: Send + Sync + fmt::Debug {
    /// Short identifier used in logs and the health endpoint.
    fn name(&self) -> &str;

    /// Computes the embedding of a decoded image.
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>>;
}

/// Execution backend a model is loaded onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// GPU or other accelerator.
    Accelerated,
    /// Plain CPU.
    Cpu,
}

/// Builds a [`VisionModel`] on a given backend.
pub trait ModelLoader: Send + Sync + fmt::Debug {
    /// Loads the model. May block for a long time.
    fn load(&self, backend: Backend) -> Result<Arc<dyn VisionModel>>;
}

/// Lifecycle of the shared model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelState {
    /// No load has been attempted.
    Uninitialized,
    /// A load is in flight.
    Loading,
    /// The model is usable.
    Ready {
        /// Model name.
        model: String,
        /// Backend it ended up on.
        backend: Backend,
    },
    /// The last load attempt failed; the next request retries.
    Failed {
        /// Rendered load error.
        error: String,
    },
}

/// Lazily loads a model once and hands out shared references to it.
///
/// Concurrent callers during a load wait on the same in-flight initialization.
/// Loading tries [`Backend::Accelerated`] first and falls back to
/// [`Backend::Cpu`] transparently. A failed load leaves the handle empty so a
/// later call retries. The load runs on its own task, so a caller that gives
/// up waiting does not abandon it.
#[derive(Debug)]
pub struct ModelHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    loader: Arc<dyn ModelLoader>,
    model: OnceCell<Arc<dyn VisionModel>>,
    state: RwLock<ModelState>,
}

impl ModelHandle {
    /// Wraps a loader without loading anything yet.
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                loader,
                model: OnceCell::new(),
                state: RwLock::new(ModelState::Uninitialized),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ModelState {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns the loaded model, loading it first if needed.
    pub async fn get(&self) -> crate::error::Result<Arc<dyn VisionModel>> {
        if let Some(model) = self.inner.model.get() {
            return Ok(Arc::clone(model));
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let model = inner.model.get_or_try_init(|| inner.load()).await.map(Arc::clone);
            model
        })
        .await?
    }
}

impl HandleInner {
    fn set_state(&self, state: ModelState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn load(&self) -> crate::error::Result<Arc<dyn VisionModel>> {
        self.set_state(ModelState::Loading);

        let loader = Arc::clone(&self.loader);
        let loaded = tokio::task::spawn_blocking(move || load_with_fallback(loader.as_ref()))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|result| result);

        match loaded {
            Ok((model, backend)) => {
                log::info!("Vision model {} ready ({:?})", model.name(), backend);
                self.set_state(ModelState::Ready {
                    model: model.name().to_string(),
                    backend,
                });
                Ok(model)
            }
            Err(e) => {
                let error = format!("{:#}", e);
                log::error!("Failed to load vision model: {}", error);
                self.set_state(ModelState::Failed { error: error.clone() });
                Err(AppError::ModelLoad(error))
            }
        }
    }
}

fn load_with_fallback(loader: &dyn ModelLoader) -> Result<(Arc<dyn VisionModel>, Backend)> {
    match loader.load(Backend::Accelerated) {
        Ok(model) => Ok((model, Backend::Accelerated)),
        Err(e) => {
            log::warn!("Accelerated backend unavailable ({:#}), falling back to CPU", e);
            let model = loader.load(Backend::Cpu)?;
            Ok((model, Backend::Cpu))
        }
    }
}

/// Side length images are downscaled to before extracting colour features.
const HISTOGRAM_THUMBNAIL: u32 = 32;
/// Quantisation levels per RGB channel.
const HISTOGRAM_LEVELS: usize = 4;
/// Cells per side of the spatial colour grid.
const HISTOGRAM_GRID: u32 = 4;

/// Dimension of [`HistogramModel`] embeddings.
pub const HISTOGRAM_DIM: usize =
    HISTOGRAM_LEVELS * HISTOGRAM_LEVELS * HISTOGRAM_LEVELS + (HISTOGRAM_GRID * HISTOGRAM_GRID * 3) as usize;

/// Deterministic colour descriptor: a joint RGB histogram plus a coarse grid
/// of mean colours, both centred so that unrelated images land near zero
/// cosine similarity.
#[derive(Debug, Default, Clone, Copy)]
pub struct HistogramModel;

impl VisionModel for HistogramModel {
    fn name(&self) -> &str {
        "colour-histogram"
    }

    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let thumb = image
            .resize_exact(
                HISTOGRAM_THUMBNAIL,
                HISTOGRAM_THUMBNAIL,
                image::imageops::FilterType::Triangle,
            )
            .to_rgb8();

        let bins = HISTOGRAM_LEVELS * HISTOGRAM_LEVELS * HISTOGRAM_LEVELS;
        let cells = (HISTOGRAM_GRID * HISTOGRAM_GRID) as usize;
        let cell_side = HISTOGRAM_THUMBNAIL / HISTOGRAM_GRID;

        let mut histogram = vec![0.0f32; bins];
        let mut grid = vec![0.0f32; cells * 3];

        for (x, y, pixel) in thumb.enumerate_pixels() {
            let level = |c: u8| c as usize * HISTOGRAM_LEVELS / 256;
            let bin = (level(pixel[0]) * HISTOGRAM_LEVELS + level(pixel[1])) * HISTOGRAM_LEVELS
                + level(pixel[2]);
            histogram[bin] += 1.0;

            let cell = ((y / cell_side) * HISTOGRAM_GRID + x / cell_side) as usize;
            for channel in 0..3 {
                grid[cell * 3 + channel] += pixel[channel] as f32 / 255.0;
            }
        }

        let pixels = (HISTOGRAM_THUMBNAIL * HISTOGRAM_THUMBNAIL) as f32;
        let per_cell = (cell_side * cell_side) as f32;
        let uniform = 1.0 / bins as f32;

        let mut embedding = Vec::with_capacity(HISTOGRAM_DIM);
        embedding.extend(histogram.iter().map(|count| count / pixels - uniform));
        embedding.extend(grid.iter().map(|sum| sum / per_cell - 0.5));
        Ok(embedding)
    }
}

/// Loader for [`HistogramModel`]; it runs the same on every backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct HistogramLoader;

impl ModelLoader for HistogramLoader {
    fn load(&self, _backend: Backend) -> Result<Arc<dyn VisionModel>> {
        Ok(Arc::new(HistogramModel))
    }
}

#[cfg(feature = "embeddings")]
pub use self::resnet::{ResnetLoader, ResnetModel};

#[cfg(feature = "embeddings")]
mod resnet {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex, PoisonError};

    use anyhow::{bail, Context, Result};
    use image::DynamicImage;
    use ndarray::Array1;
    use tch::{nn, nn::ModuleT, vision::resnet, Device, Kind, Tensor};

    use super::{Backend, ModelLoader, VisionModel};

    /// ResNet-50 trunk (final classifier removed) producing 2048-d embeddings.
    pub struct ResnetModel {
        net: Mutex<nn::FuncT<'static>>,
        _vs: nn::VarStore,
        device: Device,
    }

    impl std::fmt::Debug for ResnetModel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ResnetModel").field("device", &self.device).finish()
        }
    }

    impl ResnetModel {
        /// Loads pre-trained weights onto `device`.
        pub fn load(weights: &std::path::Path, device: Device) -> Result<Self> {
            let mut vs = nn::VarStore::new(device);
            let net = resnet::resnet50_no_final_layer(&vs.root());
            vs.load(weights)
                .with_context(|| format!("loading weights from {}", weights.display()))?;

            Ok(Self {
                net: Mutex::new(net),
                _vs: vs,
                device,
            })
        }

        /// Preprocess an image for the model
        fn preprocess_image(&self, img: &DynamicImage) -> Tensor {
            // Resize to 224x224 (standard size for ResNet)
            let rgb_img = img
                .resize_exact(224, 224, image::imageops::FilterType::Triangle)
                .to_rgb8();

            let data: Vec<f32> = rgb_img.as_raw().iter().map(|&v| v as f32 / 255.0).collect();

            // HWC -> CHW
            let tensor = Tensor::of_slice(&data)
                .view([224, 224, 3])
                .permute(&[2, 0, 1])
                .to_kind(Kind::Float);

            let mean = Tensor::of_slice(&[0.485f32, 0.456, 0.406]).view([3, 1, 1]);
            let std = Tensor::of_slice(&[0.229f32, 0.224, 0.225]).view([3, 1, 1]);

            // Add batch dimension [1, 3, 224, 224]
            ((tensor - &mean) / &std).unsqueeze(0)
        }
    }

    impl VisionModel for ResnetModel {
        fn name(&self) -> &str {
            "resnet50"
        }

        fn embed(&self, img: &DynamicImage) -> Result<Vec<f32>> {
            let input = self.preprocess_image(img).to(self.device);
            let net = self.net.lock().unwrap_or_else(PoisonError::into_inner);
            let output = tch::no_grad(|| net.forward_t(&input, false))
                .flatten(0, -1)
                .to(Device::Cpu);

            // unit length, so the trunk's magnitude drift doesn't leak into scores
            let mut embedding = Array1::from(Vec::<f32>::try_from(output)?);
            let norm = embedding.dot(&embedding).sqrt();
            if norm > 0.0 {
                embedding /= norm;
            }
            Ok(embedding.to_vec())
        }
    }

    /// Loads [`ResnetModel`] from a weights file, on CUDA when asked for acceleration.
    #[derive(Debug, Clone)]
    pub struct ResnetLoader {
        weights: PathBuf,
    }

    impl ResnetLoader {
        /// Creates a loader for the given `.ot` weights file.
        pub fn new(weights: impl Into<PathBuf>) -> Self {
            Self {
                weights: weights.into(),
            }
        }
    }

    impl ModelLoader for ResnetLoader {
        fn load(&self, backend: Backend) -> Result<Arc<dyn VisionModel>> {
            let device = match backend {
                Backend::Accelerated if tch::Cuda::is_available() => Device::Cuda(0),
                Backend::Accelerated => bail!("CUDA is not available"),
                Backend::Cpu => Device::Cpu,
            };
            Ok(Arc::new(ResnetModel::load(&self.weights, device)?))
        }
    }
}

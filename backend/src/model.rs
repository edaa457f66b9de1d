use ndarray::{Array2, Array4};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tch::nn::{self, ModuleT};
use tch::{Device, Kind, Tensor};

use crate::densenet::DenseNet;

pub const MODEL_NAME: &str = "DenseNet-121";

const HEAD_PREFIX: &str = "classifier.";

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),
    #[error("Input tensor is not contiguous")]
    NonContiguousInput,
    #[error("Class index {index} out of range for {classes} classes")]
    ClassOutOfRange { index: usize, classes: usize },
    #[error("Saliency map has unexpected shape {0:?}")]
    SaliencyShape(Vec<i64>),
    #[error(
        "Weights file {path} is missing {} backbone variables (first: {first})",
        .missing.len()
    )]
    MissingWeights {
        path: String,
        first: String,
        missing: Vec<String>,
    },
    #[error("Model lock poisoned")]
    Poisoned,
}

/// Runtime-independent view of the classifier used by request handling.
///
/// `predict` returns one independent probability per class. `explain` returns
/// a non-negative class-activation map at the resolution of the explained
/// feature layer; resizing and normalization happen at render time.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError>;

    fn explain(
        &self,
        input: &Array4<f32>,
        class_index: usize,
    ) -> Result<Array2<f32>, InferenceError>;
}

struct Network {
    // Owns the variables the modules in `net` point into.
    vs: nn::VarStore,
    net: DenseNet,
}

pub struct Model {
    network: Mutex<Network>,
    device: Device,
    num_classes: usize,
}

impl Model {
    /// Randomly initialized network in evaluation mode.
    pub fn new(num_classes: usize, device: Device) -> Self {
        let mut vs = nn::VarStore::new(device);
        let net = DenseNet::densenet121(&vs.root(), num_classes as i64);
        vs.freeze();
        Self {
            network: Mutex::new(Network { vs, net }),
            device,
            num_classes,
        }
    }

    /// Builds the network and copies every backbone tensor from `weights_path`.
    /// The classifier head is only copied when its shape matches; otherwise the
    /// fresh head sized for `num_classes` is kept.
    pub fn load(
        weights_path: &Path,
        num_classes: usize,
        device: Device,
    ) -> Result<Self, InferenceError> {
        let model = Self::new(num_classes, device);
        {
            let network = model.network.lock().map_err(|_| InferenceError::Poisoned)?;
            load_weights(&network.vs, weights_path)?;
        }
        Ok(model)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn input_tensor(&self, input: &Array4<f32>) -> Result<Tensor, InferenceError> {
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let data = input.as_slice().ok_or(InferenceError::NonContiguousInput)?;
        Ok(Tensor::from_slice(data).f_view(shape.as_slice())?.f_to_device(self.device)?)
    }
}

fn load_weights(vs: &nn::VarStore, path: &Path) -> Result<(), InferenceError> {
    let named = match path.extension().and_then(|ext| ext.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(path)?,
        _ => Tensor::load_multi(path)?,
    };

    let mut variables = vs.variables();
    let mut loaded = HashSet::new();
    tch::no_grad(|| -> Result<(), InferenceError> {
        for (name, src) in named {
            let Some(var) = variables.get_mut(&name) else {
                continue;
            };
            if var.size() != src.size() {
                if name.starts_with(HEAD_PREFIX) {
                    log::info!(
                        "Replacing classifier head variable {} ({:?} -> {:?})",
                        name,
                        src.size(),
                        var.size()
                    );
                    continue;
                }
                return Err(tch::TchError::Shape(format!(
                    "{}: expected {:?}, found {:?}",
                    name,
                    var.size(),
                    src.size()
                ))
                .into());
            }
            var.f_copy_(&src.f_to_device(vs.device())?)?;
            loaded.insert(name);
        }
        Ok(())
    })?;

    let mut missing: Vec<String> = variables
        .keys()
        .filter(|name| !name.starts_with(HEAD_PREFIX) && !loaded.contains(*name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(InferenceError::MissingWeights {
            path: path.display().to_string(),
            first: missing[0].clone(),
            missing,
        });
    }

    log::info!(
        "Loaded {} of {} variables from {}",
        loaded.len(),
        variables.len(),
        path.display()
    );
    Ok(())
}

impl Classifier for Model {
    fn name(&self) -> &str {
        MODEL_NAME
    }

    fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let xs = self.input_tensor(input)?;
        let network = self.network.lock().map_err(|_| InferenceError::Poisoned)?;
        let scores = tch::no_grad(|| network.net.forward_t(&xs, false)).f_sigmoid()?;
        let scores = scores.f_to_kind(Kind::Float)?.f_to_device(Device::Cpu)?.f_view([-1])?;
        Ok(Vec::<f32>::try_from(&scores)?)
    }

    fn explain(
        &self,
        input: &Array4<f32>,
        class_index: usize,
    ) -> Result<Array2<f32>, InferenceError> {
        if class_index >= self.num_classes {
            return Err(InferenceError::ClassOutOfRange {
                index: class_index,
                classes: self.num_classes,
            });
        }
        let xs = self.input_tensor(input)?;
        let network = self.network.lock().map_err(|_| InferenceError::Poisoned)?;

        // Gradients only need to flow from the logit back to the feature map.
        let activations = tch::no_grad(|| network.net.features(&xs, false))
            .detach()
            .set_requires_grad(true);
        let logits = network.net.head(&activations);
        let target = logits.f_get(0)?.f_get(class_index as i64)?;
        let gradients = Tensor::f_run_backward(&[&target], &[&activations], false, false)?;
        let gradients = gradients
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::SaliencyShape(activations.size()))?;

        let cam = tch::no_grad(|| -> Result<Tensor, InferenceError> {
            let weights = gradients.f_mean_dim([2i64, 3].as_slice(), true, Kind::Float)?;
            let cam = (&activations * weights)
                .f_sum_dim_intlist([1i64].as_slice(), false, Kind::Float)?
                .f_relu()?;
            Ok(cam.f_to_device(Device::Cpu)?)
        })?;

        let size = cam.size();
        let &[1, height, width] = size.as_slice() else {
            return Err(InferenceError::SaliencyShape(size));
        };
        let values = Vec::<f32>::try_from(&cam.f_view([-1])?)?;
        Array2::from_shape_vec((height as usize, width as usize), values)
            .map_err(|_| InferenceError::SaliencyShape(size.clone()))
    }
}

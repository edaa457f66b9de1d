use tch::nn::{self, ModuleT};
use tch::Tensor;

const GROWTH_RATE: i64 = 32;
const BN_SIZE: i64 = 4;
const INIT_FEATURES: i64 = 64;
const BLOCK_CONFIG: [i64; 4] = [6, 12, 24, 16];

/// Channel count of the final feature map of DenseNet-121.
pub const NUM_FEATURES: i64 = 1024;

fn conv2d(
    p: nn::Path,
    c_in: i64,
    c_out: i64,
    ksize: i64,
    padding: i64,
    stride: i64,
) -> nn::Conv2D {
    let config = nn::ConvConfig {
        stride,
        padding,
        bias: false,
        ..Default::default()
    };
    nn::conv2d(p, c_in, c_out, ksize, config)
}

fn dense_layer(p: nn::Path, c_in: i64) -> nn::FuncT<'static> {
    let c_inter = BN_SIZE * GROWTH_RATE;
    let norm1 = nn::batch_norm2d(&p / "norm1", c_in, Default::default());
    let conv1 = conv2d(&p / "conv1", c_in, c_inter, 1, 0, 1);
    let norm2 = nn::batch_norm2d(&p / "norm2", c_inter, Default::default());
    let conv2 = conv2d(&p / "conv2", c_inter, GROWTH_RATE, 3, 1, 1);
    nn::func_t(move |xs, train| {
        let ys = xs
            .apply_t(&norm1, train)
            .relu()
            .apply(&conv1)
            .apply_t(&norm2, train)
            .relu()
            .apply(&conv2);
        Tensor::cat(&[xs, &ys], 1)
    })
}

fn dense_block(p: nn::Path, c_in: i64, nlayers: i64) -> nn::SequentialT {
    let mut seq = nn::seq_t();
    for i in 0..nlayers {
        let layer = dense_layer(&p / format!("denselayer{}", i + 1), c_in + i * GROWTH_RATE);
        seq = seq.add(layer);
    }
    seq
}

fn transition(p: nn::Path, c_in: i64, c_out: i64) -> nn::SequentialT {
    nn::seq_t()
        .add(nn::batch_norm2d(&p / "norm", c_in, Default::default()))
        .add_fn(|xs| xs.relu())
        .add(conv2d(&p / "conv", c_in, c_out, 1, 0, 1))
        .add_fn(|xs| xs.avg_pool2d_default(2))
}

/// DenseNet-121 split at the boundary Grad-CAM needs: `features` ends with
/// `features.norm5` and `head` applies the ReLU, the global pool and the
/// linear classifier. Variable names follow torchvision so its checkpoints
/// load as-is.
#[derive(Debug)]
pub struct DenseNet {
    features: nn::SequentialT,
    classifier: nn::Linear,
}

impl DenseNet {
    pub fn densenet121(p: &nn::Path, num_classes: i64) -> Self {
        let fp = p / "features";
        let mut features = nn::seq_t()
            .add(conv2d(&fp / "conv0", 3, INIT_FEATURES, 7, 3, 2))
            .add(nn::batch_norm2d(&fp / "norm0", INIT_FEATURES, Default::default()))
            .add_fn(|xs| xs.relu().max_pool2d([3, 3], [2, 2], [1, 1], [1, 1], false));

        let mut nfeat = INIT_FEATURES;
        for (i, &nlayers) in BLOCK_CONFIG.iter().enumerate() {
            let block = dense_block(&fp / format!("denseblock{}", i + 1), nfeat, nlayers);
            features = features.add(block);
            nfeat += nlayers * GROWTH_RATE;
            if i + 1 != BLOCK_CONFIG.len() {
                let down = transition(&fp / format!("transition{}", i + 1), nfeat, nfeat / 2);
                features = features.add(down);
                nfeat /= 2;
            }
        }
        let features = features.add(nn::batch_norm2d(&fp / "norm5", nfeat, Default::default()));

        let classifier =
            nn::linear(p / "classifier", NUM_FEATURES, num_classes, Default::default());
        Self { features, classifier }
    }

    /// Activations of `features.norm5`, shape `[N, 1024, H/32, W/32]`.
    pub fn features(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply_t(&self.features, train)
    }

    /// Logits computed from the `features.norm5` activations.
    pub fn head(&self, features: &Tensor) -> Tensor {
        features
            .relu()
            .adaptive_avg_pool2d([1, 1])
            .flat_view()
            .apply(&self.classifier)
    }
}

impl ModuleT for DenseNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.head(&self.features(xs, train))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn parameter_names_follow_torchvision() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = DenseNet::densenet121(&vs.root(), 14);
        let variables = vs.variables();

        for name in [
            "features.conv0.weight",
            "features.norm0.running_mean",
            "features.denseblock1.denselayer1.norm1.weight",
            "features.denseblock4.denselayer16.conv2.weight",
            "features.transition3.conv.weight",
            "features.norm5.running_var",
            "classifier.weight",
            "classifier.bias",
        ] {
            assert!(variables.contains_key(name), "missing {name}");
        }
        assert_eq!(variables["classifier.weight"].size(), vec![14, NUM_FEATURES]);
    }

    #[test]
    fn feature_map_is_seven_by_seven_at_224() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = DenseNet::densenet121(&vs.root(), 14);
        let xs = Tensor::zeros([1, 3, 224, 224], (Kind::Float, Device::Cpu));

        let features = tch::no_grad(|| net.features(&xs, false));
        assert_eq!(features.size(), vec![1, NUM_FEATURES, 7, 7]);

        let logits = tch::no_grad(|| net.head(&features));
        assert_eq!(logits.size(), vec![1, 14]);
    }
}

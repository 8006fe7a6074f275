use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// standard deviation of the Gaussian weight initialization shared by
/// every dense layer of the imputing autoencoder
pub const DEFAULT_WEIGHT_SD: f64 = 0.1;

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A linear layer `x W' + b` with `W ~ N(0, sd^2)` and `b = 0`
///
/// * `vb.pp(..)/weight` - out_dim x in_dim
/// * `vb.pp(..)/bias` - out_dim
pub fn normal_linear(in_dim: usize, out_dim: usize, sd: f64, vb: VarBuilder) -> Result<Linear> {
    let init_ws = candle_nn::Init::Randn {
        mean: 0.,
        stdev: sd,
    };
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", init_ws)?;
    let bs = vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?;
    Ok(Linear::new(ws, Some(bs)))
}

/// Stack `in_dim -> layers[0] -> ... -> layers[L-1]` of ReLU layers,
/// each created under `vb.pp("{prefix}.{j}")`.
///
/// Returns the stack and the output dimension (`in_dim` if `layers`
/// is empty).
pub fn relu_stack(
    in_dim: usize,
    layers: &[usize],
    prefix: &str,
    vb: VarBuilder,
) -> Result<(StackLayers<Linear>, usize)> {
    let mut fc = StackLayers::<Linear>::new();
    let mut prev_dim = in_dim;
    for (j, &next_dim) in layers.iter().enumerate() {
        let name = format!("{}.{}", prefix, j);
        fc.push_with_act(
            normal_linear(prev_dim, next_dim, DEFAULT_WEIGHT_SD, vb.pp(name))?,
            Activation::Relu,
        );
        prev_dim = next_dim;
    }
    Ok((fc, prev_dim))
}

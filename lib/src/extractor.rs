use crate::{Error, Tensor};

/// Where and how wide tensor work runs.
///
/// Passed explicitly to every extractor call instead of living in global
/// state. Only the host CPU is supported, so the context boils down to the
/// number of worker threads a single pass may fan out to.
#[derive(Copy, Clone, Debug)]
pub struct ComputeContext {
    max_thread_count: usize,
}

impl ComputeContext {
    /// A context using at most `max_thread_count` threads (minimum 1)
    pub fn new(max_thread_count: usize) -> Self {
        Self {
            max_thread_count: max_thread_count.max(1),
        }
    }

    /// Single threaded, fully deterministic context
    pub fn single_threaded() -> Self {
        Self::new(1)
    }

    #[inline]
    pub fn max_thread_count(&self) -> usize {
        self.max_thread_count
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

/// The ordered activations produced by one forward pass.
#[derive(Clone, Debug)]
pub struct Activations {
    layers: Vec<Tensor>,
}

impl Activations {
    pub fn new(layers: Vec<Tensor>) -> Self {
        Self { layers }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The activation at `index`, or an error if the index is out of range
    pub fn layer(&self, index: usize) -> Result<&Tensor, Error> {
        self.layers.get(index).ok_or(Error::LayerOutOfRange {
            index,
            len: self.layers.len(),
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tensor> {
        self.layers.iter()
    }
}

/// A fixed, pretrained convolutional network used purely for inference.
///
/// Implementations must be pure: the same input always yields the same
/// activations, and weights are never modified after construction.
pub trait FeatureExtractor: Send + Sync {
    /// Human readable name of each activation, in output order
    fn layer_names(&self) -> Vec<String>;

    /// Position of the activation used as the content representation
    fn content_index(&self) -> usize;

    /// Positions of the activations used for the style representation
    fn style_indices(&self) -> &[usize];

    /// Runs the network on a normalized 3 channel image.
    fn extract(&self, ctx: &ComputeContext, image: &Tensor) -> Result<Activations, Error>;

    /// Vector-Jacobian product of [`FeatureExtractor::extract`].
    ///
    /// `activation_grads[i]` is the gradient of a scalar loss with respect to
    /// activation `i`, `None` meaning zero. `activations` must be the result of
    /// calling `extract` on `image`. Returns the gradient of the loss with
    /// respect to `image`.
    fn backpropagate(
        &self,
        ctx: &ComputeContext,
        image: &Tensor,
        activations: &Activations,
        activation_grads: &[Option<Tensor>],
    ) -> Result<Tensor, Error>;
}

impl<F: FeatureExtractor + ?Sized> FeatureExtractor for Box<F> {
    fn layer_names(&self) -> Vec<String> {
        (**self).layer_names()
    }

    fn content_index(&self) -> usize {
        (**self).content_index()
    }

    fn style_indices(&self) -> &[usize] {
        (**self).style_indices()
    }

    fn extract(&self, ctx: &ComputeContext, image: &Tensor) -> Result<Activations, Error> {
        (**self).extract(ctx, image)
    }

    fn backpropagate(
        &self,
        ctx: &ComputeContext,
        image: &Tensor,
        activations: &Activations,
        activation_grads: &[Option<Tensor>],
    ) -> Result<Tensor, Error> {
        (**self).backpropagate(ctx, image, activations, activation_grads)
    }
}

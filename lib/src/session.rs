use crate::{
    loss::{compute_losses, Targets},
    representation::{get_content_rep, get_style_rep},
    utils::{load_dynamic_image, load_image, postprocess, preprocess, resolve_shape},
    Adam, AdamConfig, ComputeContext, ConvNet, Dims, Error, FeatureExtractor, ImageSource,
    InitPolicy, LossWeights, Losses, OutputImage, OutputShape, Parameters, StylizedImage, Tensor,
};
use ndarray::Array3;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg32;
use std::path::{Path, PathBuf};

/// Standard deviation of the noise a randomly initialized image starts from
const RANDOM_INIT_SIGMA: f32 = 255.0 / 2.0;

/// PCG stream selector for the random initialization
const RANDOM_INIT_STREAM: u64 = 0x6e6f_6973_6521;

/// Style transfer session.
///
/// A built session has already extracted its targets and initialized the
/// output image. Calling `run()` performs every remaining iteration and
/// returns the final image, consuming the session in the process. `step()`
/// performs a single iteration, which is mostly useful to drive the
/// optimization yourself.
///
/// # Example
/// ```no_run
/// let session = neural_style::Session::builder()
///     .content_image(&"imgs/tom.jpg")
///     .style_image(&"imgs/starry_night.jpg")
///     .build().expect("failed to build session");
///
/// let stylized = session.run(None, None).expect("optimization failed");
/// stylized.save("stylized.jpg").expect("failed to save image");
/// ```
pub struct Session {
    extractor: Box<dyn FeatureExtractor>,
    ctx: ComputeContext,
    targets: Targets,
    out_img: OutputImage,
    optimizer: Adam,
    params: Parameters,
    iteration: u32,
    last_losses: Losses,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// Index of the next iteration to run
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn total_iterations(&self) -> u32 {
        self.params.iterations
    }

    /// True once every iteration has run
    pub fn is_done(&self) -> bool {
        self.iteration >= self.params.iterations
    }

    /// The image being optimized, still in the normalized tensor space
    pub fn output(&self) -> &OutputImage {
        &self.out_img
    }

    /// The content and style representations the output is optimized towards
    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    pub fn weights(&self) -> &LossWeights {
        &self.params.weights
    }

    /// Runs one iteration: evaluate the losses, backpropagate into the output
    /// image, take an optimizer step and clear the gradient.
    ///
    /// Returns the unweighted losses of the image *before* the step. Errors
    /// other than a non-finite loss are wrapped in [`Error::Iteration`].
    pub fn step(&mut self) -> Result<Losses, Error> {
        let iteration = self.iteration;
        self.try_step().map_err(|e| match e {
            Error::NonFinite { .. } => e,
            e => Error::Iteration {
                iteration,
                source: Box::new(e),
            },
        })
    }

    fn try_step(&mut self) -> Result<Losses, Error> {
        let iteration = self.iteration;

        let eval = compute_losses(
            self.extractor.as_ref(),
            &self.ctx,
            self.out_img.value(),
            &self.targets.content,
            self.targets.content_index,
            &self.targets.style,
            &self.targets.style_indices,
            &self.params.weights,
        )?;

        let losses = eval.losses;
        if !losses.total.is_finite() {
            return Err(Error::NonFinite {
                iteration,
                loss: losses.total,
            });
        }

        eval.backward(self.extractor.as_ref(), &self.ctx, &mut self.out_img)?;
        self.optimizer.step(&mut self.out_img)?;
        self.out_img.zero_grad();

        self.iteration += 1;
        self.last_losses = losses;
        Ok(losses)
    }

    /// The current output image converted back to 8-bit RGB
    pub fn snapshot(&self) -> Result<image::RgbImage, Error> {
        postprocess(self.out_img.value())
    }

    /// Runs every remaining iteration.
    ///
    /// Losses are logged every `log_frequency` iterations, and a checkpoint
    /// is handed to `checkpoints` every `saving_frequency` iterations, both
    /// also on the final iteration. Any failure, including a checkpoint that
    /// can't be written, aborts the run.
    pub fn run(
        mut self,
        mut progress: Option<Box<dyn StyleProgress>>,
        mut checkpoints: Option<&mut dyn CheckpointSink>,
    ) -> Result<StylizedImage, Error> {
        let total = self.params.iterations;
        let log_cadence = Cadence::new(self.params.log_freq);
        let save_cadence = Cadence::new(self.params.saving_freq);

        log::info!("Iteration starts");

        while !self.is_done() {
            let it = self.iteration;
            let losses = self.step()?;
            let weighted = losses.weighted(&self.params.weights);

            if log_cadence.is_due(it, total) {
                log::info!("{}", iteration_line(it, &weighted));
            }

            if let Some(ref mut progress) = progress {
                progress.update(ProgressUpdate {
                    iteration: it,
                    total_iterations: total,
                    losses,
                    weighted,
                    image: self.out_img.value(),
                });
            }

            if save_cadence.is_due(it, total) {
                if let Some(ref mut sink) = checkpoints {
                    let snapshot = self.snapshot().and_then(|img| sink.save(it, &img));
                    if let Err(e) = snapshot {
                        return Err(Error::Checkpoint {
                            iteration: it,
                            source: Box::new(e),
                        });
                    }
                }
            }
        }

        Ok(StylizedImage {
            image: self.snapshot()?,
            losses: self.last_losses,
        })
    }
}

/// Builds a session by setting parameters and adding the input images,
/// calling `build` will check all of the provided inputs and prepare the
/// optimization.
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    extractor: Option<Box<dyn FeatureExtractor>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose content is preserved
    pub fn content_image<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.content = Some(img.into());
        self
    }

    /// The image whose style is transferred onto the content
    pub fn style_image<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(img.into());
        self
    }

    /// Uses a specific feature extractor instead of the default VGG-19
    /// layout.
    ///
    /// Note the default network is seeded rather than trained, load trained
    /// weights with [`ConvNet::read`] and pass them here for the best results.
    pub fn extractor<E: FeatureExtractor + 'static>(mut self, extractor: E) -> Self {
        self.extractor = Some(Box::new(extractor));
        self
    }

    /// Weight of the content loss.
    ///
    /// Default: 1e5
    pub fn content_weight(mut self, value: f32) -> Self {
        self.params.weights.content = value;
        self
    }

    /// Weight of the style loss.
    ///
    /// Default: 5e4
    pub fn style_weight(mut self, value: f32) -> Self {
        self.params.weights.style = value;
        self
    }

    /// Weight of the total variation loss, which smooths the output.
    ///
    /// Default: 1
    pub fn tv_weight(mut self, value: f32) -> Self {
        self.params.weights.tv = value;
        self
    }

    /// Sets all three loss weights at once
    pub fn loss_weights(mut self, weights: LossWeights) -> Self {
        self.params.weights = weights;
        self
    }

    /// How the output image is initialized.
    ///
    /// Default: `InitPolicy::Content`
    pub fn init(mut self, policy: InitPolicy) -> Self {
        self.params.init = policy;
        self
    }

    /// Size of the output image.
    ///
    /// Default: `OutputShape::HalfContent`
    pub fn output_shape(mut self, shape: OutputShape) -> Self {
        self.params.shape = shape;
        self
    }

    /// Number of optimization iterations.
    ///
    /// Default: 3000
    pub fn iterations(mut self, count: u32) -> Self {
        self.params.iterations = count;
        self
    }

    /// Adam learning rate, in 0-255 pixel units.
    ///
    /// Default: 5.0
    pub fn learning_rate(mut self, value: f32) -> Self {
        self.params.learning_rate = value;
        self
    }

    /// Losses are logged every this many iterations.
    ///
    /// Default: 50
    pub fn log_frequency(mut self, every: u32) -> Self {
        self.params.log_freq = every;
        self
    }

    /// A checkpoint image is saved every this many iterations.
    ///
    /// Default: 200
    pub fn saving_frequency(mut self, every: u32) -> Self {
        self.params.saving_freq = every;
        self
    }

    /// Seed for the random initialization, and for the weights of the
    /// default extractor.
    ///
    /// Default: 0
    pub fn seed(mut self, value: u64) -> Self {
        self.params.seed = value;
        self
    }

    /// Controls the maximum number of threads a single forward or backward
    /// pass fans out to. The optimization loop itself is always sequential.
    ///
    /// Setting this number to `1` runs everything on the calling thread.
    ///
    /// Default: The number of logical cores on this system.
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or input
    /// images were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.check_parameters_validity()?;

        let content = load_dynamic_image(self.content.ok_or(Error::MissingImage("content"))?)?;
        let style = load_dynamic_image(self.style.ok_or(Error::MissingImage("style"))?)?;

        let content_dims = {
            use image::GenericImageView;
            Dims::new(content.width(), content.height())
        };
        let dims = resolve_shape(content_dims, self.params.shape)?;

        let content_img = preprocess(&load_image(&content, dims));
        let style_img = preprocess(&load_image(&style, dims));

        let ctx = ComputeContext::new(
            self.params
                .max_thread_count
                .unwrap_or_else(num_cpus::get),
        );

        let extractor = match self.extractor {
            Some(extractor) => extractor,
            None => Box::new(ConvNet::vgg19(self.params.seed)?),
        };

        log::info!(
            "Extracting features from {}x{} images",
            dims.width,
            dims.height
        );
        let content_index = extractor.content_index();
        let style_indices = extractor.style_indices().to_vec();

        let targets = {
            let content_features = extractor.extract(&ctx, &content_img)?;
            let style_features = extractor.extract(&ctx, &style_img)?;

            Targets {
                content: get_content_rep(&content_features, content_index)?,
                content_index,
                style: get_style_rep(&style_features, &style_indices)?,
                style_indices,
            }
        };

        let out_img = OutputImage::new(match self.params.init {
            InitPolicy::Random => random_image(&content_img, self.params.seed)?,
            InitPolicy::Content => content_img,
            InitPolicy::Style => style_img,
        });
        let optimizer = AdamConfig::default().init(self.params.learning_rate, &out_img);

        Ok(Session {
            extractor,
            ctx,
            targets,
            out_img,
            optimizer,
            params: self.params,
            iteration: 0,
            last_losses: Losses::default(),
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        let weights = &self.params.weights;
        for &(name, value) in &[
            ("content-weight", weights.content),
            ("style-weight", weights.style),
            ("tv-weight", weights.tv),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidRange(crate::errors::InvalidRange {
                    min: 0.0,
                    max: f32::MAX,
                    value,
                    name,
                }));
            }
        }

        if !self.params.learning_rate.is_finite() || self.params.learning_rate <= 0.0 {
            return Err(Error::InvalidRange(crate::errors::InvalidRange {
                min: f32::EPSILON,
                max: f32::MAX,
                value: self.params.learning_rate,
                name: "lr",
            }));
        }

        for &(name, value) in &[
            ("iterations", self.params.iterations),
            ("log-freq", self.params.log_freq),
            ("saving-freq", self.params.saving_freq),
        ] {
            if value == 0 {
                return Err(Error::InvalidRange(crate::errors::InvalidRange {
                    min: 1.0,
                    max: u32::MAX as f32,
                    value: value as f32,
                    name,
                }));
            }
        }

        if let Some(max_count) = self.params.max_thread_count {
            if max_count == 0 {
                return Err(Error::InvalidRange(crate::errors::InvalidRange {
                    min: 1.0,
                    max: 1024.0,
                    value: max_count as f32,
                    name: "max-thread-count",
                }));
            }
        }

        match self.params.shape {
            OutputShape::Height(0) => Err(Error::InvalidShape(
                "the output height must be at least 1".to_owned(),
            )),
            OutputShape::Exact(dims) if dims.width == 0 || dims.height == 0 => Err(
                Error::InvalidShape(format!("{}x{} has no pixels", dims.width, dims.height)),
            ),
            _ => Ok(()),
        }
    }
}

/// Gaussian noise around the mean pixel, shaped like `like`. Drawn from its
/// own PCG stream, so it never repeats the sequence the default extractor
/// weights are drawn from for the same seed.
fn random_image(like: &Tensor, seed: u64) -> Result<Tensor, Error> {
    let mut rng = Pcg32::new(seed, RANDOM_INIT_STREAM);
    let normal = Normal::new(0.0, RANDOM_INIT_SIGMA)
        .map_err(|e| Error::InvalidShape(e.to_string()))?;

    Ok(Tensor::from(Array3::from_shape_fn(like.shape(), |_| {
        normal.sample(&mut rng)
    })))
}

/// The console line logged for an iteration, `weighted` holding the losses
/// already multiplied by their weights
fn iteration_line(iteration: u32, weighted: &Losses) -> String {
    format!(
        "iteration: {:04}, total loss={}, content_loss={}, style loss={}, tv loss={}",
        iteration, weighted.total, weighted.content, weighted.style, weighted.tv
    )
}

/// Decides on which iterations a periodic action happens: every `every`
/// iterations starting at 0, plus the final iteration.
#[derive(Copy, Clone, Debug)]
pub struct Cadence {
    every: u32,
}

impl Cadence {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
        }
    }

    pub fn is_due(&self, iteration: u32, total_iterations: u32) -> bool {
        iteration % self.every == 0 || iteration + 1 == total_iterations
    }

    /// Every iteration out of `total_iterations` the action happens on
    pub fn iterations(&self, total_iterations: u32) -> impl Iterator<Item = u32> + '_ {
        (0..total_iterations).filter(move |&it| self.is_due(it, total_iterations))
    }
}

/// The state of the optimization after an iteration
pub struct ProgressUpdate<'a> {
    /// The iteration that just completed
    pub iteration: u32,
    pub total_iterations: u32,
    /// Unweighted losses of the iteration
    pub losses: Losses,
    /// The same losses multiplied by their weights
    pub weighted: Losses,
    /// The output image after the iteration's update
    pub image: &'a Tensor,
}

/// Allows the session to update external callers with the current
/// progress of the optimization
pub trait StyleProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> StyleProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}

/// Receives checkpoint images during a run
pub trait CheckpointSink {
    fn save(&mut self, iteration: u32, image: &image::RgbImage) -> Result<(), Error>;
}

/// Collects checkpoints in memory
impl CheckpointSink for Vec<(u32, image::RgbImage)> {
    fn save(&mut self, iteration: u32, image: &image::RgbImage) -> Result<(), Error> {
        self.push((iteration, image.clone()));
        Ok(())
    }
}

/// Writes checkpoints as `iter{NNNN}.{extension}` into a directory, which is
/// created on the first save.
pub struct DirectoryCheckpoints {
    dir: PathBuf,
    extension: String,
    created: bool,
}

impl DirectoryCheckpoints {
    /// Checkpoints are written as jpg, use `with_extension` for another format
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_owned(),
            extension: "jpg".to_owned(),
            created: false,
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_owned();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The path a checkpoint for `iteration` is written to
    pub fn path_for(&self, iteration: u32) -> PathBuf {
        self.dir
            .join(format!("iter{:04}.{}", iteration, self.extension))
    }
}

impl CheckpointSink for DirectoryCheckpoints {
    fn save(&mut self, iteration: u32, image: &image::RgbImage) -> Result<(), Error> {
        if !self.created {
            std::fs::create_dir_all(&self.dir)?;
            self.created = true;
        }

        let path = self.path_for(iteration);
        log::debug!("saving checkpoint {}", path.display());
        image.save(&path)?;
        Ok(())
    }
}

// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` is a light API for neural style transfer: it synthesizes an
//! image that keeps the content of one image while adopting the style of
//! another, by optimizing pixels against losses computed on the activations
//! of a fixed convolutional network.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the builder pattern. Calling
//! `build` on the `SessionBuilder` loads both images, extracts the target content and style
//! representations and initializes the output image.
//!
//! `Session` has a `run()` method that performs every optimization iteration, reporting progress
//! and writing checkpoint images along the way, and returns the result as a `StylizedImage`.
//!
//! ## Usage
//!
//! ```no_run
//! // Create a new session with default parameters
//! let session = neural_style::Session::builder()
//!     .content_image(&"images/content/CBD.jpg")
//!     .style_image(&"images/style/StarryNight.jpg")
//!     // Set some parameters
//!     .init(neural_style::InitPolicy::Content)
//!     .style_weight(5e4)
//!     .iterations(1000)
//!     // Build the session
//!     .build().expect("failed to build session");
//!
//! // Optimize, saving a checkpoint every 200 iterations
//! let mut checkpoints = neural_style::DirectoryCheckpoints::new("images/output/CBD_StarryNight");
//! let stylized = session.run(None, Some(&mut checkpoints)).expect("optimization failed");
//!
//! // Save the final image to disk
//! stylized.save("stylized.png").expect("failed to save image");
//! ```
pub mod convnet;
mod errors;
mod extractor;
pub mod loss;
mod optim;
pub mod representation;
pub mod session;
mod tensor;
mod utils;

pub use image;
use std::path::Path;

pub use convnet::{ConvNet, LayerSpec};
pub use errors::Error;
pub use extractor::{Activations, ComputeContext, FeatureExtractor};
pub use loss::{compute_losses, LossWeights, Losses};
pub use optim::{Adam, AdamConfig, OutputImage};
pub use session::{
    Cadence, CheckpointSink, DirectoryCheckpoints, ProgressUpdate, Session, SessionBuilder,
    StyleProgress,
};
pub use tensor::{Matrix, Tensor};
pub use utils::{load_dynamic_image, postprocess, preprocess, resolve_shape, session_dir, ImageSource};

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// How the output image is initialized before the first iteration
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum InitPolicy {
    /// Gaussian noise centered on the mean pixel
    Random,
    /// A copy of the content image
    Content,
    /// A copy of the style image
    Style,
}

impl std::str::FromStr for InitPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "content" => Ok(Self::Content),
            "style" => Ok(Self::Style),
            other => Err(Error::InvalidInit(other.to_owned())),
        }
    }
}

impl std::fmt::Display for InitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Random => "random",
            Self::Content => "content",
            Self::Style => "style",
        })
    }
}

/// How the size of the output image is determined. Both input images are
/// resized to this size.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OutputShape {
    /// Half the width and height of the content image
    HalfContent,
    /// A fixed height, with the width following the content aspect ratio
    Height(u32),
    /// An explicit size
    Exact(Dims),
}

struct Parameters {
    weights: LossWeights,
    init: InitPolicy,
    shape: OutputShape,
    iterations: u32,
    learning_rate: f32,
    log_freq: u32,
    saving_freq: u32,
    seed: u64,
    max_thread_count: Option<usize>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            weights: LossWeights::default(),
            init: InitPolicy::Content,
            shape: OutputShape::HalfContent,
            iterations: 3000,
            learning_rate: 5.0,
            log_freq: 50,
            saving_freq: 200,
            seed: 0,
            max_thread_count: None,
        }
    }
}

/// An image produced by `Session::run()`
pub struct StylizedImage {
    image: image::RgbImage,
    losses: Losses,
}

impl StylizedImage {
    /// Saves the stylized image to the specified path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        self.image.save(&path)?;
        Ok(())
    }

    /// Writes the stylized image to the specified stream
    pub fn write<W: std::io::Write>(
        self,
        writer: &mut W,
        fmt: image::ImageOutputFormat,
    ) -> Result<(), Error> {
        let dyn_img = image::DynamicImage::ImageRgb8(self.image);
        Ok(dyn_img.write_to(writer, fmt)?)
    }

    /// The unweighted losses of the final iteration
    pub fn losses(&self) -> Losses {
        self.losses
    }

    /// Returns the stylized output image
    pub fn into_image(self) -> image::RgbImage {
        self.image
    }
}

impl AsRef<image::RgbImage> for StylizedImage {
    fn as_ref(&self) -> &image::RgbImage {
        &self.image
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn init_policy_parsing() {
        for policy in &[InitPolicy::Random, InitPolicy::Content, InitPolicy::Style] {
            assert_eq!(policy.to_string().parse::<InitPolicy>().unwrap(), *policy);
        }

        assert!(matches!(
            "noise".parse::<InitPolicy>(),
            Err(Error::InvalidInit(ref s)) if s == "noise"
        ));
    }
}

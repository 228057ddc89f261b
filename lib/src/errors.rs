use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// The requested output shape can't be turned into a valid image size
    InvalidShape(String),
    /// The content or style image wasn't provided
    MissingImage(&'static str),
    /// The initialization policy wasn't one of `random`, `content` or `style`
    InvalidInit(String),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
    /// A content or style layer index points past the end of the activations
    LayerOutOfRange { index: usize, len: usize },
    /// A style layer has no matching target Gram matrix
    MissingStyleTarget(usize),
    /// A tensor didn't have the shape an operation required
    ShapeMismatch {
        expected: (usize, usize, usize),
        actual: usize,
    },
    /// A feature extractor weight file was malformed
    InvalidWeights(String),
    /// The loss stopped being a finite number at the given iteration
    NonFinite { iteration: u32, loss: f64 },
    /// Persisting a checkpoint image failed at the given iteration
    Checkpoint { iteration: u32, source: Box<Error> },
    /// An optimization step failed at the given iteration
    Iteration { iteration: u32, source: Box<Error> },
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Checkpoint { source, .. } | Self::Iteration { source, .. } => {
                Some(source.as_ref())
            }
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::InvalidShape(shape) => write!(f, "invalid output shape: {}", shape),
            Self::MissingImage(which) => write!(f, "no {} image was provided", which),
            Self::InvalidInit(init) => write!(
                f,
                "init method '{}' not one of: 'random', 'content', 'style'",
                init
            ),
            Self::Io(io) => write!(f, "{}", io),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
            Self::LayerOutOfRange { index, len } => write!(
                f,
                "layer index {} is out of range, the extractor only produces {} activation(s)",
                index, len
            ),
            Self::MissingStyleTarget(index) => {
                write!(f, "no target style representation for layer {}", index)
            }
            Self::ShapeMismatch { expected, actual } => write!(
                f,
                "expected a tensor of shape {}x{}x{} ({} elements), but got {} elements",
                expected.0,
                expected.1,
                expected.2,
                expected.0 * expected.1 * expected.2,
                actual
            ),
            Self::InvalidWeights(msg) => write!(f, "invalid weight file: {}", msg),
            Self::NonFinite { iteration, loss } => write!(
                f,
                "iteration {:04}: loss became non-finite ({})",
                iteration, loss
            ),
            Self::Checkpoint { iteration, source } => write!(
                f,
                "iteration {:04}: failed to save checkpoint: {}",
                iteration, source
            ),
            Self::Iteration { iteration, source } => {
                write!(f, "iteration {:04}: {}", iteration, source)
            }
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

use crate::{Dims, Error, OutputShape, Tensor};
use std::path::{Path, PathBuf};

/// Per channel ImageNet mean, in 0-255 RGB order, that the extractor expects
/// to be subtracted from its input.
pub const IMAGENET_MEAN: [f32; 3] = [123.68, 116.779, 103.939];

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image that is passed directly to the session
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a> From<image::RgbImage> for ImageSource<'a> {
    fn from(img: image::RgbImage) -> Self {
        Self::Image(image::DynamicImage::ImageRgb8(img))
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

pub(crate) fn load_image(img: &image::DynamicImage, size: Dims) -> image::RgbImage {
    use image::GenericImageView;

    if img.width() != size.width || img.height() != size.height {
        image::imageops::resize(
            &img.to_rgb(),
            size.width,
            size.height,
            image::imageops::CatmullRom,
        )
    } else {
        img.to_rgb()
    }
}

/// Works out the output image size from the content image size
pub fn resolve_shape(content: Dims, shape: OutputShape) -> Result<Dims, Error> {
    let dims = match shape {
        OutputShape::HalfContent => Dims::new(content.width / 2, content.height / 2),
        OutputShape::Height(height) => {
            if content.height == 0 {
                return Err(Error::InvalidShape(
                    "the content image has no height".to_owned(),
                ));
            }
            let width = u64::from(height) * u64::from(content.width) / u64::from(content.height);
            Dims::new(width as u32, height)
        }
        OutputShape::Exact(dims) => dims,
    };

    if dims.width == 0 || dims.height == 0 {
        return Err(Error::InvalidShape(format!(
            "{}x{} has no pixels",
            dims.width, dims.height
        )));
    }

    Ok(dims)
}

/// The directory checkpoints of a content/style pair are written to,
/// `<root>/<content stem>_<style stem>`
pub fn session_dir(root: &Path, content: &Path, style: &Path) -> PathBuf {
    let stem = |p: &Path| {
        p.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_owned())
    };

    root.join(format!("{}_{}", stem(content), stem(style)))
}

/// Converts an 8-bit RGB image into the mean-centered, channels first layout
/// the extractor consumes.
pub fn preprocess(img: &image::RgbImage) -> Tensor {
    let (width, height) = img.dimensions();
    let (w, h) = (width as usize, height as usize);
    let mut tensor = Tensor::zeros(3, h, w);

    for (x, y, pixel) in img.enumerate_pixels() {
        for (c, mean) in IMAGENET_MEAN.iter().enumerate() {
            tensor.set(c, y as usize, x as usize, f32::from(pixel[c]) - mean);
        }
    }

    tensor
}

/// Inverse of [`preprocess`], clamping values that left the 0-255 range
pub fn postprocess(tensor: &Tensor) -> Result<image::RgbImage, Error> {
    let (c, h, w) = tensor.shape();
    if c != 3 {
        return Err(Error::ShapeMismatch {
            expected: (3, h, w),
            actual: tensor.len(),
        });
    }

    Ok(image::RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let mut pixel = [0u8; 3];
        for (ch, mean) in IMAGENET_MEAN.iter().enumerate() {
            let v = tensor.get(ch, y as usize, x as usize) + mean;
            pixel[ch] = v.round().max(0.0).min(255.0) as u8;
        }
        image::Rgb(pixel)
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shape_policies() {
        let content = Dims::new(640, 480);
        assert_eq!(
            resolve_shape(content, OutputShape::HalfContent).unwrap(),
            Dims::new(320, 240)
        );
        assert_eq!(
            resolve_shape(content, OutputShape::Height(120)).unwrap(),
            Dims::new(160, 120)
        );
        assert_eq!(
            resolve_shape(content, OutputShape::Exact(Dims::new(7, 9))).unwrap(),
            Dims::new(7, 9)
        );
        assert!(matches!(
            resolve_shape(Dims::new(1, 1), OutputShape::HalfContent),
            Err(Error::InvalidShape(_))
        ));
    }

    #[test]
    fn session_dir_uses_stems() {
        let dir = session_dir(
            Path::new("images/output"),
            Path::new("images/content/CBD.jpg"),
            Path::new("StarryNight.png"),
        );
        assert_eq!(dir, Path::new("images/output/CBD_StarryNight"));
    }

    #[test]
    fn pre_and_post_processing_invert() {
        let img = image::RgbImage::from_fn(3, 2, |x, y| {
            image::Rgb([(x * 80) as u8, (y * 200) as u8, 17])
        });

        let tensor = preprocess(&img);
        assert_eq!(tensor.shape(), (3, 2, 3));
        assert!((tensor.get(2, 0, 0) - (17.0 - IMAGENET_MEAN[2])).abs() < 1e-4);

        assert_eq!(postprocess(&tensor).unwrap(), img);
    }

    #[test]
    fn postprocess_clamps() {
        let t = Tensor::filled(3, 1, 1, 1000.0);
        assert_eq!(postprocess(&t).unwrap().get_pixel(0, 0), &image::Rgb([255; 3]));

        let t = Tensor::filled(3, 1, 1, -1000.0);
        assert_eq!(postprocess(&t).unwrap().get_pixel(0, 0), &image::Rgb([0; 3]));
    }
}

mod progress_window;

use structopt::StructOpt;

use neural_style::{
    image::ImageOutputFormat as ImgFmt, ConvNet, Dims, DirectoryCheckpoints, Error, InitPolicy,
    OutputShape, Session,
};
use progress_window::ProgressWindow;
use std::path::PathBuf;

fn parse_img_fmt(input: &str) -> Result<ImgFmt, String> {
    let fmt = match input {
        "png" => ImgFmt::Png,
        "jpg" => ImgFmt::Jpeg(75),
        "bmp" => ImgFmt::Bmp,
        other => {
            return Err(format!(
                "image format `{}` not one of: 'png', 'jpg', 'bmp'",
                other
            ))
        }
    };

    Ok(fmt)
}

/// Turns the `--shape H W` pair into an output shape, `-1` marks a dimension
/// that is derived from the content image
fn parse_shape(shape: &[i64]) -> Result<OutputShape, Error> {
    match *shape {
        [] | [-1, -1] => Ok(OutputShape::HalfContent),
        [h, -1] if h > 0 && h <= i64::from(u32::MAX) => Ok(OutputShape::Height(h as u32)),
        [h, w] if h > 0 && w > 0 && h <= i64::from(u32::MAX) && w <= i64::from(u32::MAX) => {
            Ok(OutputShape::Exact(Dims::new(w as u32, h as u32)))
        }
        _ => Err(Error::InvalidShape(format!(
            "'{}' is not one of `-1 -1`, `H -1` or `H W`",
            shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        ))),
    }
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Repaints a content image in the style of another image",
    rename_all = "kebab-case"
)]
struct Opt {
    /// The image whose content is kept
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The image whose style is transferred
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// How the output image is initialized, one of `random`, `content` or `style`
    #[structopt(long, default_value = "content")]
    init: InitPolicy,
    /// Weight of the content loss
    #[structopt(long, default_value = "1e5")]
    content_weight: f32,
    /// Weight of the style loss
    #[structopt(long, default_value = "5e4")]
    style_weight: f32,
    /// Weight of the total variation loss, larger values give a smoother output
    #[structopt(long, default_value = "1")]
    tv_weight: f32,
    /// A checkpoint image is saved every this many iterations, and after the last one
    #[structopt(long, default_value = "200")]
    saving_freq: u32,
    /// The losses are logged every this many iterations, and after the last one
    #[structopt(long, default_value = "50")]
    log_freq: u32,
    /// The number of optimization iterations
    #[structopt(long, default_value = "3000")]
    iterations: u32,
    /// The Adam learning rate, in 0-255 pixel units
    #[structopt(long, default_value = "5")]
    lr: f32,
    /// The output size as `H W`. `-1 -1` (the default) halves the content image
    /// size, `H -1` fixes the height and keeps the content aspect ratio.
    #[structopt(long, number_of_values = 2, allow_hyphen_values = true)]
    shape: Vec<i64>,
    /// A safetensors weight file for the feature extractor. Without one, a seeded network
    /// with the VGG-19 layout is used.
    #[structopt(long, parse(from_os_str))]
    weights: Option<PathBuf>,
    /// Checkpoints are written to `<out-dir>/<content>_<style>/iterNNNN.jpg`
    #[structopt(long, default_value = "images/output", parse(from_os_str))]
    out_dir: PathBuf,
    /// A seed for the random initialization and the default extractor weights
    #[structopt(long)]
    seed: Option<u64>,
    /// The maximum number of threads a single forward or backward pass uses.
    /// Defaults to the logical core count.
    #[structopt(short = "t", long = "threads")]
    max_threads: Option<usize>,
    /// Don't show a progress bar
    #[structopt(long)]
    no_progress: bool,
    /// The format to save the final image as.
    ///
    /// NOTE: this will only apply when stdout is specified via `-o -`, otherwise the image
    /// format is determined by the file extension of the path provided to `-o`
    #[structopt(
        long,
        default_value = "png",
        parse(try_from_str = parse_img_fmt)
    )]
    out_fmt: ImgFmt,
    /// The path to save the final image to, the file extensions of the path determines
    /// the image format used. You may use `-` for stdout.
    #[structopt(long = "out", short, parse(from_os_str))]
    output_path: Option<PathBuf>,
}

fn main() {
    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    // Check that the extension for the path supplied by the user is one of the ones we support
    if let Some(ref output_path) = args.output_path {
        match output_path.extension().and_then(|ext| ext.to_str()) {
            Some("png") | Some("jpg") | Some("bmp") => {}
            None => {}
            Some(other) => return Err(Error::UnsupportedOutputFormat(other.to_owned())),
        }
    }

    // Logs go to stderr so `-o -` can still be used
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing_subscriber::filter::LevelFilter::INFO)
        .init();

    let mut sb = Session::builder()
        .content_image(&args.content)
        .style_image(&args.style)
        .init(args.init)
        .content_weight(args.content_weight)
        .style_weight(args.style_weight)
        .tv_weight(args.tv_weight)
        .saving_frequency(args.saving_freq)
        .log_frequency(args.log_freq)
        .iterations(args.iterations)
        .learning_rate(args.lr)
        .output_shape(parse_shape(&args.shape)?)
        .seed(args.seed.unwrap_or_default());

    if let Some(mt) = args.max_threads {
        sb = sb.max_thread_count(mt);
    }

    if let Some(ref weights) = args.weights {
        log::info!("Loading extractor weights from {}", weights.display());
        let mut reader = std::io::BufReader::new(std::fs::File::open(weights)?);
        sb = sb.extractor(ConvNet::read(&mut reader)?);
    }

    let session = sb.build()?;

    let progress: Option<Box<dyn neural_style::StyleProgress>> = if !args.no_progress {
        Some(Box::new(ProgressWindow::new(session.total_iterations())))
    } else {
        None
    };

    let mut checkpoints = DirectoryCheckpoints::new(neural_style::session_dir(
        &args.out_dir,
        &args.content,
        &args.style,
    ));
    log::info!("Checkpoints are saved to {}", checkpoints.dir().display());

    let stylized = session.run(progress, Some(&mut checkpoints))?;

    match args.output_path {
        Some(ref path) if path.to_str() == Some("-") => {
            let out = std::io::stdout();
            let mut out = out.lock();
            stylized.write(&mut out, args.out_fmt)?;
        }
        // This won't respect the output format specified by the user,
        // only the extension on the path they specify
        Some(ref path) => stylized.save(path)?,
        None => {}
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shape_arguments() {
        assert_eq!(parse_shape(&[]).unwrap(), OutputShape::HalfContent);
        assert_eq!(parse_shape(&[-1, -1]).unwrap(), OutputShape::HalfContent);
        assert_eq!(parse_shape(&[256, -1]).unwrap(), OutputShape::Height(256));
        assert_eq!(
            parse_shape(&[256, 512]).unwrap(),
            OutputShape::Exact(Dims::new(512, 256))
        );
        assert!(parse_shape(&[-1, 512]).is_err());
        assert!(parse_shape(&[0, -1]).is_err());
    }
}

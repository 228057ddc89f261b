use neural_style as ns;
use std::path::Path;

fn main() -> Result<(), ns::Error> {
    let content = Path::new("images/content/CBD.jpg");
    let style = Path::new("images/style/StarryNight.jpg");

    // trained weights make a huge difference, fall back to the seeded network
    // if they aren't around
    let extractor = match std::fs::File::open("vgg19.safetensors") {
        Ok(file) => ns::ConvNet::read(&mut std::io::BufReader::new(file))?,
        Err(_) => ns::ConvNet::vgg19(0)?,
    };

    let session = ns::Session::builder()
        .content_image(&content)
        .style_image(&style)
        .extractor(extractor)
        // start from noise rather than the content image
        .init(ns::InitPolicy::Random)
        .seed(42)
        .style_weight(1e5)
        .iterations(1000)
        .saving_frequency(100)
        .build()?;

    let progress = |update: ns::ProgressUpdate<'_>| {
        if update.iteration % 10 == 0 {
            println!(
                "{}/{}: {:.4e}",
                update.iteration, update.total_iterations, update.weighted.total
            );
        }
    };

    // checkpoints land in out/CBD_StarryNight/iterNNNN.jpg
    let mut checkpoints =
        ns::DirectoryCheckpoints::new(ns::session_dir(Path::new("out"), content, style));

    let stylized = session.run(Some(Box::new(progress)), Some(&mut checkpoints))?;
    stylized.save("out/02.png")
}

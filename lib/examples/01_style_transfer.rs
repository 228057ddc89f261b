use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let session = ns::Session::builder()
        // the image whose content we keep
        .content_image(&"images/content/CBD.jpg")
        // the image whose style gets painted onto it
        .style_image(&"images/style/StarryNight.jpg")
        // keep the output small, every iteration is a forward and backward pass
        .output_shape(ns::OutputShape::Height(256))
        .iterations(500)
        .build()?;

    let stylized = session.run(None, None)?;

    // save the result to the disk
    stylized.save("out/01.jpg")
}

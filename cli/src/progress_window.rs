use indicatif::{ProgressBar, ProgressStyle};

pub struct ProgressWindow {
    pb: ProgressBar,
    total_len: u32,
}

impl ProgressWindow {
    pub fn new(total_iterations: u32) -> Self {
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len} {msg}")
            .progress_chars("##-");

        let pb = ProgressBar::new(u64::from(total_iterations));
        pb.set_style(sty);

        Self {
            pb,
            total_len: total_iterations,
        }
    }
}

impl Drop for ProgressWindow {
    fn drop(&mut self) {
        self.pb.finish();
    }
}

impl neural_style::StyleProgress for ProgressWindow {
    fn update(&mut self, update: neural_style::ProgressUpdate<'_>) {
        if update.total_iterations != self.total_len {
            self.total_len = update.total_iterations;
            self.pb.set_length(u64::from(self.total_len));
        }

        self.pb.set_position(u64::from(update.iteration) + 1);
        self.pb
            .set_message(&format!("loss {:.4e}", update.weighted.total));
    }
}

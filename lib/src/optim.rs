use crate::{Error, Tensor};
use ndarray::Zip;

/// The image being optimized, together with its gradient buffer.
///
/// Backpropagation *adds* into the gradient buffer, so [`OutputImage::zero_grad`]
/// has to be called once per iteration, after the optimizer step, or
/// gradients from previous iterations leak into the next one.
#[derive(Clone, Debug)]
pub struct OutputImage {
    value: Tensor,
    grad: Tensor,
}

impl OutputImage {
    pub fn new(value: Tensor) -> Self {
        let grad = value.zeros_like();
        Self { value, grad }
    }

    #[inline]
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    #[inline]
    pub fn grad(&self) -> &Tensor {
        &self.grad
    }

    /// Adds `grad` into the gradient buffer
    pub fn accumulate_grad(&mut self, grad: &Tensor) -> Result<(), Error> {
        self.grad.check_same_shape(grad)?;
        self.grad.add_scaled(grad, 1.0);
        Ok(())
    }

    /// Resets the gradient buffer to all zeros
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

}

/// Adam configuration, defaults match the usual `torch.optim.Adam` ones.
#[derive(Copy, Clone, Debug)]
pub struct AdamConfig {
    pub beta_1: f32,
    pub beta_2: f32,
    /// A value required for numerical stability.
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl AdamConfig {
    /// Initializes an optimizer bound to tensors shaped like `param`
    pub fn init(&self, learning_rate: f32, param: &OutputImage) -> Adam {
        Adam {
            config: *self,
            learning_rate,
            time: 0,
            moment_1: param.value.zeros_like(),
            moment_2: param.value.zeros_like(),
        }
    }
}

/// Adam optimizer as described in [Adam: A Method for Stochastic Optimization](https://arxiv.org/pdf/1412.6980.pdf),
/// holding the moment estimates for a single tensor.
pub struct Adam {
    config: AdamConfig,
    learning_rate: f32,
    time: i32,
    moment_1: Tensor,
    moment_2: Tensor,
}

impl Adam {
    /// Number of steps taken so far
    pub fn time(&self) -> i32 {
        self.time
    }

    /// Updates `param` in place from its current gradient buffer. The buffer
    /// itself is left untouched.
    pub fn step(&mut self, param: &mut OutputImage) -> Result<(), Error> {
        param.value.check_same_shape(&self.moment_1)?;

        let AdamConfig {
            beta_1,
            beta_2,
            epsilon,
        } = self.config;

        self.time += 1;
        let correction_1 = 1.0 - beta_1.powi(self.time);
        let correction_2 = 1.0 - beta_2.powi(self.time);
        let lr = self.learning_rate;

        Zip::from(param.value.view_mut())
            .and(param.grad.view())
            .and(self.moment_1.view_mut())
            .and(self.moment_2.view_mut())
            .for_each(|p, &g, m, v| {
                *m = beta_1 * *m + (1.0 - beta_1) * g;
                *v = beta_2 * *v + (1.0 - beta_2) * g * g;

                let m_hat = *m / correction_1;
                let v_hat = *v / correction_2;
                *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
            });

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_grad_clears_accumulation() {
        let mut img = OutputImage::new(Tensor::filled(1, 2, 2, 1.0));
        let g = Tensor::filled(1, 2, 2, 0.5);

        img.accumulate_grad(&g).unwrap();
        img.accumulate_grad(&g).unwrap();
        assert!(img.grad().iter().all(|v| *v == 1.0));

        img.zero_grad();
        assert!(img.grad().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn accumulate_rejects_wrong_shape() {
        let mut img = OutputImage::new(Tensor::zeros(1, 2, 2));
        assert!(img.accumulate_grad(&Tensor::zeros(1, 2, 3)).is_err());
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        // with bias correction the first Adam step is lr * sign(grad)
        let mut img = OutputImage::new(Tensor::from_vec(1, 1, 2, vec![0.0, 0.0]).unwrap());
        img.accumulate_grad(&Tensor::from_vec(1, 1, 2, vec![3.0, -0.25]).unwrap())
            .unwrap();

        let mut adam = AdamConfig::default().init(5.0, &img);
        adam.step(&mut img).unwrap();

        assert_eq!(adam.time(), 1);
        assert!((img.value().get(0, 0, 0) + 5.0).abs() < 1e-4);
        assert!((img.value().get(0, 0, 1) - 5.0).abs() < 1e-4);
    }

    #[test]
    fn minimizes_a_quadratic() {
        let mut img = OutputImage::new(Tensor::filled(1, 1, 3, 10.0));
        let mut adam = AdamConfig::default().init(0.5, &img);

        for _ in 0..200 {
            // d/dx x^2
            let grad = Tensor::from_vec(
                1,
                1,
                3,
                img.value().iter().map(|x| 2.0 * x).collect(),
            )
            .unwrap();
            img.accumulate_grad(&grad).unwrap();
            adam.step(&mut img).unwrap();
            img.zero_grad();
        }

        assert!(img.value().iter().all(|x| x.abs() < 0.5));
    }
}

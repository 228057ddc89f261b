//! Content, style and total variation losses, along with their analytic
//! gradients with respect to the output image.

use crate::{
    representation::{gram_matrix, gram_matrix_backward, StyleRepresentation},
    Activations, ComputeContext, Error, FeatureExtractor, OutputImage, Tensor,
};
use ndarray::{s, Array3};

/// How much each loss term contributes to the total loss
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossWeights {
    pub content: f32,
    pub style: f32,
    pub tv: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            content: 1e5,
            style: 5e4,
            tv: 1.0,
        }
    }
}

/// The loss values of a single evaluation.
///
/// `content`, `style` and `tv` are unweighted, `total` is their weighted sum.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Losses {
    pub total: f64,
    pub content: f64,
    pub style: f64,
    pub tv: f64,
}

impl Losses {
    /// The same losses, with each term pre-multiplied by its weight, which is
    /// how they add up to `total`.
    pub fn weighted(&self, weights: &LossWeights) -> Self {
        Self {
            total: self.total,
            content: f64::from(weights.content) * self.content,
            style: f64::from(weights.style) * self.style,
            tv: f64::from(weights.tv) * self.tv,
        }
    }
}

/// The fixed targets the output image is optimized towards
pub struct Targets {
    pub content: Tensor,
    pub content_index: usize,
    pub style: StyleRepresentation,
    pub style_indices: Vec<usize>,
}

/// The result of a forward pass through the loss, holding what the backward
/// pass needs.
pub struct LossEvaluation {
    pub losses: Losses,
    activations: Activations,
    activation_grads: Vec<Option<Tensor>>,
    tv_grad: Option<Tensor>,
}

impl LossEvaluation {
    /// Backpropagates the weighted total loss and adds the resulting gradient
    /// into `out_img`'s gradient buffer.
    pub fn backward<E: FeatureExtractor + ?Sized>(
        &self,
        extractor: &E,
        ctx: &ComputeContext,
        out_img: &mut OutputImage,
    ) -> Result<(), Error> {
        if self.activation_grads.iter().any(Option::is_some) {
            let grad = extractor.backpropagate(
                ctx,
                out_img.value(),
                &self.activations,
                &self.activation_grads,
            )?;
            out_img.accumulate_grad(&grad)?;
        }

        if let Some(ref tv_grad) = self.tv_grad {
            out_img.accumulate_grad(tv_grad)?;
        }

        Ok(())
    }
}

/// Runs the extractor on the output image and evaluates every loss term.
///
/// The style loss is the *mean* of the per-layer Gram matrix MSEs, so its
/// magnitude doesn't depend on how many style layers are used; it is zero
/// when there are none. Every term is evaluated even when its weight is zero,
/// but zero-weighted terms don't contribute to the gradient.
#[allow(clippy::too_many_arguments)]
pub fn compute_losses<E: FeatureExtractor + ?Sized>(
    extractor: &E,
    ctx: &ComputeContext,
    out_img: &Tensor,
    target_content: &Tensor,
    content_index: usize,
    target_style: &StyleRepresentation,
    style_indices: &[usize],
    weights: &LossWeights,
) -> Result<LossEvaluation, Error> {
    let activations = extractor.extract(ctx, out_img)?;
    let mut activation_grads: Vec<Option<Tensor>> = vec![None; activations.len()];

    let mut add_grad = |index: usize, mut grad: Tensor, scale: f32| {
        let merged = match activation_grads[index].take() {
            Some(mut g) => {
                g.add_scaled(&grad, scale);
                g
            }
            None => {
                grad.scale(scale);
                grad
            }
        };
        activation_grads[index] = Some(merged);
    };

    // content
    let current = activations.layer(content_index)?;
    current.check_same_shape(target_content)?;
    let content = current.mse(target_content);
    if weights.content != 0.0 {
        add_grad(
            content_index,
            current.mse_grad(target_content),
            weights.content,
        );
    }

    // style
    let mut style = 0.0;
    if !style_indices.is_empty() {
        let layer_scale = 1.0 / style_indices.len() as f64;

        for &index in style_indices {
            let act = activations.layer(index)?;
            let target = target_style
                .get(&index)
                .ok_or(Error::MissingStyleTarget(index))?;
            let gram = gram_matrix(act)?;
            if gram.size() != target.size() {
                return Err(Error::ShapeMismatch {
                    expected: (target.size(), target.size(), 1),
                    actual: gram.size() * gram.size(),
                });
            }

            style += gram.mse(target) * layer_scale;

            if weights.style != 0.0 {
                let grad_gram = gram.mse_grad(target);
                add_grad(
                    index,
                    gram_matrix_backward(act, &grad_gram)?,
                    weights.style * layer_scale as f32,
                );
            }
        }
    }

    // total variation
    let tv = total_variation(out_img);
    let tv_grad = if weights.tv != 0.0 {
        let mut g = total_variation_grad(out_img);
        g.scale(weights.tv);
        Some(g)
    } else {
        None
    };

    let total = f64::from(weights.content) * content
        + f64::from(weights.style) * style
        + f64::from(weights.tv) * tv;

    Ok(LossEvaluation {
        losses: Losses {
            total,
            content,
            style,
            tv,
        },
        activations,
        activation_grads,
        tv_grad,
    })
}

/// Mean squared difference between horizontally adjacent pixels plus the
/// mean squared difference between vertically adjacent pixels. An axis of
/// extent 1 has no neighbors and contributes nothing.
pub fn total_variation(img: &Tensor) -> f64 {
    let (_, h, w) = img.shape();
    let view = img.view();
    let mean_square = |d: Array3<f32>| {
        let len = d.len() as f64;
        d.fold(0.0, |acc, &v| acc + f64::from(v) * f64::from(v)) / len
    };

    let mut tv = 0.0;
    if w > 1 {
        tv += mean_square(&view.slice(s![.., .., 1..]) - &view.slice(s![.., .., ..-1]));
    }
    if h > 1 {
        tv += mean_square(&view.slice(s![.., 1.., ..]) - &view.slice(s![.., ..-1, ..]));
    }
    tv
}

/// Gradient of [`total_variation`] with respect to the image
pub fn total_variation_grad(img: &Tensor) -> Tensor {
    let (c, h, w) = img.shape();
    let view = img.view();
    let mut grad = img.zeros_like();
    let mut g = grad.view_mut();

    if w > 1 {
        let scale = 2.0 / (c * h * (w - 1)) as f32;
        let d = (&view.slice(s![.., .., 1..]) - &view.slice(s![.., .., ..-1])) * scale;
        g.slice_mut(s![.., .., 1..]).scaled_add(1.0, &d);
        g.slice_mut(s![.., .., ..-1]).scaled_add(-1.0, &d);
    }
    if h > 1 {
        let scale = 2.0 / (c * (h - 1) * w) as f32;
        let d = (&view.slice(s![.., 1.., ..]) - &view.slice(s![.., ..-1, ..])) * scale;
        g.slice_mut(s![.., 1.., ..]).scaled_add(1.0, &d);
        g.slice_mut(s![.., ..-1, ..]).scaled_add(-1.0, &d);
    }

    grad
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        convnet::{ConvNet, LayerSpec},
        representation::{get_content_rep, get_style_rep},
    };

    fn net() -> ConvNet {
        ConvNet::from_layout(
            &[LayerSpec::Conv(4), LayerSpec::Pool, LayerSpec::Conv(6)],
            1,
            &[0, 1],
            3,
        )
        .unwrap()
    }

    fn image(seed: usize) -> Tensor {
        let data = (0..3 * 6 * 6)
            .map(|i| (((i + seed) * 29 % 97) as f32 - 48.0) * 0.5)
            .collect();
        Tensor::from_vec(3, 6, 6, data).unwrap()
    }

    fn targets(net: &ConvNet, content: &Tensor, style: &Tensor) -> Targets {
        let ctx = ComputeContext::single_threaded();
        let c = net.extract(&ctx, content).unwrap();
        let s = net.extract(&ctx, style).unwrap();
        Targets {
            content: get_content_rep(&c, net.content_index()).unwrap(),
            content_index: net.content_index(),
            style: get_style_rep(&s, net.style_indices()).unwrap(),
            style_indices: net.style_indices().to_vec(),
        }
    }

    fn evaluate(net: &ConvNet, out: &Tensor, t: &Targets, w: &LossWeights) -> LossEvaluation {
        compute_losses(
            net,
            &ComputeContext::single_threaded(),
            out,
            &t.content,
            t.content_index,
            &t.style,
            &t.style_indices,
            w,
        )
        .unwrap()
    }

    #[test]
    fn content_loss_zero_on_content_image() {
        let net = net();
        let t = targets(&net, &image(0), &image(1));
        let eval = evaluate(&net, &image(0), &t, &LossWeights::default());

        assert_eq!(eval.losses.content, 0.0);
        assert!(eval.losses.style > 0.0);
    }

    #[test]
    fn style_loss_zero_on_style_image() {
        let net = net();
        let t = targets(&net, &image(0), &image(1));
        let eval = evaluate(&net, &image(1), &t, &LossWeights::default());

        assert_eq!(eval.losses.style, 0.0);
        assert!(eval.losses.content > 0.0);
    }

    #[test]
    fn empty_style_indices_give_zero_style_loss() {
        let net = net();
        let mut t = targets(&net, &image(0), &image(1));
        t.style_indices.clear();
        let eval = evaluate(&net, &image(2), &t, &LossWeights::default());

        assert_eq!(eval.losses.style, 0.0);
    }

    #[test]
    fn missing_style_target_is_an_error() {
        let net = net();
        let mut t = targets(&net, &image(0), &image(1));
        t.style.remove(&1);

        let res = compute_losses(
            &net,
            &ComputeContext::single_threaded(),
            &image(2),
            &t.content,
            t.content_index,
            &t.style,
            &t.style_indices,
            &LossWeights::default(),
        );
        assert!(matches!(res, Err(Error::MissingStyleTarget(1))));
    }

    #[test]
    fn total_is_weighted_sum() {
        let net = net();
        let t = targets(&net, &image(0), &image(1));
        let w = LossWeights {
            content: 2.0,
            style: 3.0,
            tv: 0.5,
        };
        let l = evaluate(&net, &image(2), &t, &w).losses;

        let expected = 2.0 * l.content + 3.0 * l.style + 0.5 * l.tv;
        assert!((l.total - expected).abs() <= 1e-9 * expected.abs());

        let weighted = l.weighted(&w);
        assert!((weighted.content + weighted.style + weighted.tv - l.total).abs() <= 1e-9 * l.total);
    }

    #[test]
    fn zero_weights_still_report_losses() {
        let net = net();
        let t = targets(&net, &image(0), &image(1));
        let w = LossWeights {
            content: 0.0,
            style: 0.0,
            tv: 0.0,
        };
        let eval = evaluate(&net, &image(2), &t, &w);

        assert_eq!(eval.losses.total, 0.0);
        assert!(eval.losses.content > 0.0);
        assert!(eval.losses.style > 0.0);
        assert!(eval.losses.tv > 0.0);

        let mut out = OutputImage::new(image(2));
        eval.backward(&net, &ComputeContext::single_threaded(), &mut out)
            .unwrap();
        assert!(out.grad().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn tv_zero_for_constant_image() {
        assert_eq!(total_variation(&Tensor::filled(3, 5, 4, 42.0)), 0.0);
        assert_eq!(total_variation(&Tensor::filled(3, 1, 1, 42.0)), 0.0);
        assert!(total_variation_grad(&Tensor::filled(3, 5, 4, 42.0))
            .iter()
            .all(|v| *v == 0.0));
    }

    #[test]
    fn tv_positive_for_single_difference() {
        let mut t = Tensor::filled(3, 4, 4, 1.0);
        t.set(2, 3, 3, 1.5);
        assert!(total_variation(&t) > 0.0);

        let mut row = Tensor::filled(1, 1, 3, 0.0);
        row.set(0, 0, 1, 2.0);
        // (2^2 + 2^2) / (1 * 1 * 2), no vertical neighbors
        assert_eq!(total_variation(&row), 4.0);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let net = net();
        let ctx = ComputeContext::single_threaded();
        let t = targets(&net, &image(0), &image(1));
        let w = LossWeights {
            content: 1.0,
            style: 10.0,
            tv: 0.1,
        };

        let img = image(2);
        let eval = evaluate(&net, &img, &t, &w);
        let mut out = OutputImage::new(img.clone());
        eval.backward(&net, &ctx, &mut out).unwrap();

        let eps = 1e-2;
        for idx in [0, 11, 40, 77, 107] {
            let mut plus = img.clone();
            *plus.iter_mut().nth(idx).unwrap() += eps;
            let mut minus = img.clone();
            *minus.iter_mut().nth(idx).unwrap() -= eps;

            let numeric = (evaluate(&net, &plus, &t, &w).losses.total
                - evaluate(&net, &minus, &t, &w).losses.total)
                / (2.0 * f64::from(eps));
            let analytic = f64::from(*out.grad().iter().nth(idx).unwrap());
            assert!(
                (numeric - analytic).abs() < 2e-2 * (1.0 + analytic.abs()),
                "index {}: numeric {} vs analytic {}",
                idx,
                numeric,
                analytic
            );
        }
    }
}

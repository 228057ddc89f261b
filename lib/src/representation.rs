use crate::{Activations, Error, Matrix, Tensor};
use std::collections::BTreeMap;

/// Style representation: one Gram matrix per style layer, keyed by the
/// layer's position in the activation sequence.
pub type StyleRepresentation = BTreeMap<usize, Matrix>;

/// Snapshot of the activation at `content_index`.
///
/// The returned tensor is an owned copy, so later forward passes can't
/// change it.
pub fn get_content_rep(activations: &Activations, content_index: usize) -> Result<Tensor, Error> {
    activations.layer(content_index).map(Tensor::clone)
}

/// Gram matrices of every activation listed in `style_indices`
pub fn get_style_rep(
    activations: &Activations,
    style_indices: &[usize],
) -> Result<StyleRepresentation, Error> {
    style_indices
        .iter()
        .map(|&index| Ok((index, gram_matrix(activations.layer(index)?)?)))
        .collect()
}

/// `F·Fᵀ / (C·N)` where `F` is the activation flattened to `C x N`.
///
/// An activation without any spatial extent has an all-zero Gram matrix.
pub fn gram_matrix(activation: &Tensor) -> Result<Matrix, Error> {
    let c = activation.channels();
    let n = activation.plane_len();
    if n == 0 {
        return Ok(Matrix::zeros(c));
    }

    let f = activation.as_matrix()?;
    Matrix::from_array(f.dot(&f.t()) / (c * n) as f32)
}

/// Given `dL/dG` for `G = gram_matrix(activation)`, returns `dL/dF`.
///
/// `dL/dF = (dG + dGᵀ)·F / (C·N)`
pub fn gram_matrix_backward(activation: &Tensor, grad_gram: &Matrix) -> Result<Tensor, Error> {
    let (c, h, w) = activation.shape();
    let n = h * w;
    if n == 0 || c == 0 {
        return Ok(activation.zeros_like());
    }

    let dg = grad_gram.view();
    let f = activation.as_matrix()?;
    let grad = (&dg + &dg.t()).dot(&f) / (c * n) as f32;

    Tensor::from_matrix(grad, h, w)
}

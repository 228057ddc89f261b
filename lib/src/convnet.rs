//! A VGG style convolutional feature extractor running on the CPU.
//!
//! The network is a chain of 3x3 same-padded convolutions, each followed by a
//! ReLU, with 2x2 average pooling between blocks. Every ReLU output is exposed
//! as one activation, named `relu{block}_{n}` the way VGG layers usually are.

use crate::{Activations, ComputeContext, Error, FeatureExtractor, Tensor};
use ndarray::{s, Array1, Array4, ArrayView2, ArrayViewMut2, ArrayViewMut3, Axis, Zip};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg32;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::ops::Range;

const META_LAYOUT: &str = "layout";
const META_CONTENT: &str = "content_index";
const META_STYLE: &str = "style_indices";

/// One stage of a network layout
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LayerSpec {
    /// 3x3 convolution + ReLU producing this many channels
    Conv(usize),
    /// 2x2 average pooling
    Pool,
}

/// VGG-19 up to `relu5_1`, which is as deep as style transfer ever looks.
pub const VGG19: &[LayerSpec] = &[
    LayerSpec::Conv(64),
    LayerSpec::Conv(64),
    LayerSpec::Pool,
    LayerSpec::Conv(128),
    LayerSpec::Conv(128),
    LayerSpec::Pool,
    LayerSpec::Conv(256),
    LayerSpec::Conv(256),
    LayerSpec::Conv(256),
    LayerSpec::Conv(256),
    LayerSpec::Pool,
    LayerSpec::Conv(512),
    LayerSpec::Conv(512),
    LayerSpec::Conv(512),
    LayerSpec::Conv(512),
    LayerSpec::Pool,
    LayerSpec::Conv(512),
];

/// `relu4_2`
pub const VGG19_CONTENT_INDEX: usize = 9;
/// `relu1_1`, `relu2_1`, `relu3_1`, `relu4_1`, `relu5_1`
pub const VGG19_STYLE_INDICES: &[usize] = &[0, 2, 4, 8, 12];

struct ConvLayer {
    /// `[out, in, 3, 3]`
    weights: Array4<f32>,
    bias: Array1<f32>,
}

impl ConvLayer {
    #[inline]
    fn in_channels(&self) -> usize {
        self.weights.len_of(Axis(1))
    }

    #[inline]
    fn out_channels(&self) -> usize {
        self.weights.len_of(Axis(0))
    }
}

enum Layer {
    Conv(ConvLayer),
    Pool,
}

/// Tensor name prefix of every layer, numbered like the modules of a
/// torchvision `vgg.features` sequential: a convolution and its ReLU take two
/// slots, a pooling layer one. Pooling layers have no tensors of their own.
fn module_prefixes<I: IntoIterator<Item = bool>>(is_conv: I) -> Vec<String> {
    let mut module = 0;
    is_conv
        .into_iter()
        .map(|conv| {
            let prefix = format!("features.{}", module);
            module += if conv { 2 } else { 1 };
            prefix
        })
        .collect()
}

fn invalid(e: impl std::fmt::Display) -> Error {
    Error::InvalidWeights(e.to_string())
}

/// Reads a little endian `f32` tensor, checking that its shape and its byte
/// length agree before anything is allocated.
fn read_f32(tensors: &SafeTensors<'_>, name: &str) -> Result<(Vec<usize>, Vec<f32>), Error> {
    let view = tensors
        .tensor(name)
        .map_err(|e| Error::InvalidWeights(format!("'{}': {}", name, e)))?;

    if view.dtype() != Dtype::F32 {
        return Err(Error::InvalidWeights(format!(
            "'{}' is {:?}, expected F32",
            name,
            view.dtype()
        )));
    }

    let shape = view.shape().to_vec();
    let count = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| {
            Error::InvalidWeights(format!("'{}' has an overflowing shape {:?}", name, shape))
        })?;

    let bytes = view.data();
    if count.checked_mul(4) != Some(bytes.len()) {
        return Err(Error::InvalidWeights(format!(
            "'{}' holds {} bytes, but its shape {:?} needs {} values",
            name,
            bytes.len(),
            shape,
            count
        )));
    }

    let values = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((shape, values))
}

fn read_conv(
    tensors: &SafeTensors<'_>,
    prefix: &str,
    in_channels: usize,
) -> Result<ConvLayer, Error> {
    let name = format!("{}.weight", prefix);
    let (shape, weights) = read_f32(tensors, &name)?;
    let out_channels = match *shape.as_slice() {
        [out, i, 3, 3] if out > 0 && i == in_channels => out,
        _ => {
            return Err(Error::InvalidWeights(format!(
                "'{}' has shape {:?}, expected [_, {}, 3, 3]",
                name, shape, in_channels
            )))
        }
    };
    let weights =
        Array4::from_shape_vec((out_channels, in_channels, 3, 3), weights).map_err(invalid)?;

    let name = format!("{}.bias", prefix);
    let (shape, bias) = read_f32(tensors, &name)?;
    if shape != [out_channels] {
        return Err(Error::InvalidWeights(format!(
            "'{}' has shape {:?}, expected [{}]",
            name, shape, out_channels
        )));
    }

    Ok(ConvLayer {
        weights,
        bias: Array1::from(bias),
    })
}

fn parse_index(key: &str, value: &str) -> Result<usize, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| {
            Error::InvalidWeights(format!("'{}' is not a layer index: '{}'", key, value))
        })
}

/// Layout and layer indices stored in the file header
fn parse_header(
    header: &HashMap<String, String>,
    layout: &str,
) -> Result<(Vec<bool>, usize, Vec<usize>), Error> {
    let is_conv = layout
        .split(',')
        .map(|kind| match kind.trim() {
            "conv" => Ok(true),
            "pool" => Ok(false),
            other => Err(Error::InvalidWeights(format!(
                "unknown layer kind '{}'",
                other
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let content = header
        .get(META_CONTENT)
        .ok_or_else(|| Error::InvalidWeights(format!("missing '{}'", META_CONTENT)))?;
    let content_index = parse_index(META_CONTENT, content)?;

    let style_indices = match header.get(META_STYLE).map(|s| s.trim()) {
        None | Some("") => Vec::new(),
        Some(list) => list
            .split(',')
            .map(|v| parse_index(META_STYLE, v))
            .collect::<Result<Vec<_>, _>>()?,
    };

    Ok((is_conv, content_index, style_indices))
}

fn f32_bytes<'a>(values: impl Iterator<Item = &'a f32>) -> Vec<u8> {
    values.flat_map(|v| v.to_le_bytes()).collect()
}

/// A fixed convolutional network implementing [`FeatureExtractor`].
pub struct ConvNet {
    layers: Vec<Layer>,
    names: Vec<String>,
    content_index: usize,
    style_indices: Vec<usize>,
}

impl ConvNet {
    /// The VGG-19 layout with deterministic He-normal weights derived from
    /// `seed`. Use [`ConvNet::read`] to load trained weights instead.
    pub fn vgg19(seed: u64) -> Result<Self, Error> {
        Self::from_layout(VGG19, VGG19_CONTENT_INDEX, VGG19_STYLE_INDICES, seed)
    }

    /// Builds a network with the given layout, initializing the weights from
    /// `seed`. Indices refer to positions in the activation sequence, that is
    /// to the `n`-th convolution of the layout.
    pub fn from_layout(
        layout: &[LayerSpec],
        content_index: usize,
        style_indices: &[usize],
        seed: u64,
    ) -> Result<Self, Error> {
        let mut rng = Pcg32::seed_from_u64(seed);
        let mut in_channels = 3;
        let mut layers = Vec::with_capacity(layout.len());

        for spec in layout {
            match *spec {
                LayerSpec::Conv(out_channels) => {
                    if out_channels == 0 {
                        return Err(Error::InvalidWeights(
                            "convolution with zero output channels".to_owned(),
                        ));
                    }

                    let fan_in = (in_channels * 9) as f32;
                    let normal = Normal::new(0.0, (2.0 / fan_in).sqrt()).map_err(invalid)?;
                    let weights = Array4::from_shape_fn((out_channels, in_channels, 3, 3), |_| {
                        normal.sample(&mut rng)
                    });

                    layers.push(Layer::Conv(ConvLayer {
                        weights,
                        bias: Array1::zeros(out_channels),
                    }));
                    in_channels = out_channels;
                }
                LayerSpec::Pool => layers.push(Layer::Pool),
            }
        }

        Self::new(layers, content_index, style_indices.to_vec())
    }

    fn new(
        layers: Vec<Layer>,
        content_index: usize,
        style_indices: Vec<usize>,
    ) -> Result<Self, Error> {
        let mut names = Vec::new();
        let mut block = 1;
        let mut n = 0;
        for layer in &layers {
            match layer {
                Layer::Conv(_) => {
                    n += 1;
                    names.push(format!("relu{}_{}", block, n));
                }
                Layer::Pool => {
                    if n > 0 {
                        block += 1;
                        n = 0;
                    }
                }
            }
        }

        for &index in std::iter::once(&content_index).chain(style_indices.iter()) {
            if index >= names.len() {
                return Err(Error::LayerOutOfRange {
                    index,
                    len: names.len(),
                });
            }
        }

        Ok(Self {
            layers,
            names,
            content_index,
            style_indices,
        })
    }

    /// Serializes the network as safetensors. Every convolution is stored as
    /// a `features.{n}.weight` `[out, in, 3, 3]` and a `features.{n}.bias`
    /// tensor, the layout and layer indices go into the header metadata.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<usize, Error> {
        let prefixes = module_prefixes(self.layers.iter().map(|l| matches!(l, Layer::Conv(_))));

        let mut buffers = Vec::new();
        for (layer, prefix) in self.layers.iter().zip(&prefixes) {
            if let Layer::Conv(conv) = layer {
                buffers.push((
                    format!("{}.weight", prefix),
                    conv.weights.shape().to_vec(),
                    f32_bytes(conv.weights.iter()),
                ));
                buffers.push((
                    format!("{}.bias", prefix),
                    vec![conv.out_channels()],
                    f32_bytes(conv.bias.iter()),
                ));
            }
        }

        let views = buffers
            .iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes).map(|v| (name.as_str(), v))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;

        let layout = self
            .layers
            .iter()
            .map(|l| match l {
                Layer::Conv(_) => "conv",
                Layer::Pool => "pool",
            })
            .collect::<Vec<_>>()
            .join(",");
        let style = self
            .style_indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut header = HashMap::new();
        header.insert(META_LAYOUT.to_owned(), layout);
        header.insert(META_CONTENT.to_owned(), self.content_index.to_string());
        header.insert(META_STYLE.to_owned(), style);

        let bytes = safetensors::serialize(views, &Some(header)).map_err(invalid)?;
        w.write_all(&bytes)?;
        Ok(bytes.len())
    }

    /// Loads a network from safetensors, either written by [`ConvNet::write`]
    /// or exported from a torchvision VGG-19 `features` module. Files without
    /// a layout in their header are read as VGG-19 with the usual style
    /// transfer layers.
    pub fn read<R: Read>(r: &mut R) -> Result<Self, Error> {
        let mut buffer = Vec::new();
        r.read_to_end(&mut buffer)?;

        let (_, metadata) = SafeTensors::read_metadata(&buffer).map_err(invalid)?;
        let tensors = SafeTensors::deserialize(&buffer).map_err(invalid)?;

        let header = metadata.metadata().as_ref();
        let (is_conv, content_index, style_indices) =
            match header.and_then(|h| h.get(META_LAYOUT).map(|layout| (h, layout))) {
                Some((header, layout)) => parse_header(header, layout)?,
                None => (
                    VGG19.iter().map(|s| matches!(s, LayerSpec::Conv(_))).collect(),
                    VGG19_CONTENT_INDEX,
                    VGG19_STYLE_INDICES.to_vec(),
                ),
            };

        let prefixes = module_prefixes(is_conv.iter().copied());
        let mut in_channels = 3;
        let mut layers = Vec::with_capacity(is_conv.len());
        for (conv, prefix) in is_conv.iter().zip(&prefixes) {
            if *conv {
                let conv = read_conv(&tensors, prefix, in_channels)?;
                in_channels = conv.out_channels();
                layers.push(Layer::Conv(conv));
            } else {
                layers.push(Layer::Pool);
            }
        }

        Self::new(layers, content_index, style_indices)
    }

    /// Inputs to every layer, recomputed from the activations of a forward
    /// pass. Pooling is cheap enough that it isn't worth caching.
    fn layer_inputs<'a>(
        &self,
        image: &'a Tensor,
        activations: &'a Activations,
    ) -> Result<Vec<std::borrow::Cow<'a, Tensor>>, Error> {
        use std::borrow::Cow;

        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut current: Cow<'a, Tensor> = Cow::Borrowed(image);
        let mut act = 0;

        for layer in &self.layers {
            inputs.push(current.clone());
            current = match layer {
                Layer::Conv(_) => {
                    let out = activations.layer(act)?;
                    act += 1;
                    Cow::Borrowed(out)
                }
                Layer::Pool => Cow::Owned(avg_pool(&current)),
            };
        }

        Ok(inputs)
    }
}

impl FeatureExtractor for ConvNet {
    fn layer_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn content_index(&self) -> usize {
        self.content_index
    }

    fn style_indices(&self) -> &[usize] {
        &self.style_indices
    }

    fn extract(&self, ctx: &ComputeContext, image: &Tensor) -> Result<Activations, Error> {
        if image.channels() != 3 {
            return Err(Error::ShapeMismatch {
                expected: (3, image.height(), image.width()),
                actual: image.len(),
            });
        }

        let mut outputs = Vec::with_capacity(self.names.len());
        let mut pooled: Option<Tensor> = None;

        for layer in &self.layers {
            let input = match (&pooled, outputs.last()) {
                (Some(p), _) => p,
                (None, Some(last)) => last,
                (None, None) => image,
            };

            match layer {
                Layer::Conv(conv) => {
                    let mut out = conv_forward(ctx, conv, input);
                    out.view_mut().mapv_inplace(|v| v.max(0.0));
                    pooled = None;
                    outputs.push(out);
                }
                Layer::Pool => pooled = Some(avg_pool(input)),
            }
        }

        Ok(Activations::new(outputs))
    }

    fn backpropagate(
        &self,
        ctx: &ComputeContext,
        image: &Tensor,
        activations: &Activations,
        activation_grads: &[Option<Tensor>],
    ) -> Result<Tensor, Error> {
        if activations.len() != self.names.len() {
            return Err(Error::LayerOutOfRange {
                index: self.names.len().saturating_sub(1),
                len: activations.len(),
            });
        }

        let inputs = self.layer_inputs(image, activations)?;

        // gradient with respect to the output of the layer being visited
        let mut grad: Option<Tensor> = None;
        let mut act = activations.len();

        for (layer, input) in self.layers.iter().zip(inputs.iter()).rev() {
            match layer {
                Layer::Conv(conv) => {
                    act -= 1;
                    let output = activations.layer(act)?;

                    if let Some(Some(ext)) = activation_grads.get(act) {
                        output.check_same_shape(ext)?;
                        grad = Some(match grad.take() {
                            Some(mut g) => {
                                g.add_scaled(ext, 1.0);
                                g
                            }
                            None => ext.clone(),
                        });
                    }

                    grad = match grad.take() {
                        Some(mut g) => {
                            // relu
                            Zip::from(g.view_mut()).and(output.view()).for_each(|g, &o| {
                                if o <= 0.0 {
                                    *g = 0.0;
                                }
                            });
                            Some(conv_backward_input(ctx, conv, &g, input.shape()))
                        }
                        None => None,
                    };
                }
                Layer::Pool => {
                    grad = grad.map(|g| avg_pool_backward(&g, input.shape()));
                }
            }
        }

        Ok(grad.unwrap_or_else(|| image.zeros_like()))
    }
}

/// Output positions `start..end` along one axis for which the tap at offset
/// `d` (-1, 0 or 1) lands inside an axis of length `len`.
#[inline]
fn tap_range(d: isize, len: usize) -> (usize, usize) {
    match d {
        -1 => (1.min(len), len),
        1 => (0, len.saturating_sub(1)),
        _ => (0, len),
    }
}

/// The in-bounds positions for offset `d`, and the same positions shifted by `d`
#[inline]
fn shifted(d: isize, len: usize) -> (Range<usize>, Range<usize>) {
    let (start, end) = tap_range(d, len);
    if start >= end {
        return (0..0, 0..0);
    }
    let moved = (start as isize + d) as usize;
    (start..end, moved..moved + (end - start))
}

/// `dst[y, x] += w * src[y + dy, x + dx]` over every in-bounds position
#[inline]
fn accumulate_tap(
    dst: &mut ArrayViewMut2<'_, f32>,
    src: &ArrayView2<'_, f32>,
    w: f32,
    dy: isize,
    dx: isize,
) {
    let (h, wd) = src.dim();
    let (ys, src_ys) = shifted(dy, h);
    let (xs, src_xs) = shifted(dx, wd);
    dst.slice_mut(s![ys, xs])
        .scaled_add(w, &src.slice(s![src_ys, src_xs]));
}

/// `dst[y + dy, x + dx] += w * src[y, x]`, the transpose of [`accumulate_tap`]
#[inline]
fn scatter_tap(
    dst: &mut ArrayViewMut2<'_, f32>,
    src: &ArrayView2<'_, f32>,
    w: f32,
    dy: isize,
    dx: isize,
) {
    let (h, wd) = src.dim();
    let (ys, dst_ys) = shifted(dy, h);
    let (xs, dst_xs) = shifted(dx, wd);
    dst.slice_mut(s![dst_ys, dst_xs])
        .scaled_add(w, &src.slice(s![ys, xs]));
}

/// Hands contiguous runs of output channels to up to
/// `ctx.max_thread_count()` scoped workers.
fn for_each_channel_chunk<F>(ctx: &ComputeContext, mut out: ArrayViewMut3<'_, f32>, f: F)
where
    F: Fn(usize, ArrayViewMut3<'_, f32>) + Sync,
{
    let channels = out.len_of(Axis(0));
    if channels == 0 || out.is_empty() {
        return;
    }

    let threads = ctx.max_thread_count().min(channels);

    // for WASM we do not have threads, so just run on the current one
    #[cfg(target_arch = "wasm32")]
    let threads = threads.min(1);

    if threads <= 1 {
        f(0, out);
        return;
    }

    let chunk_channels = (channels + threads - 1) / threads;

    #[cfg(not(target_arch = "wasm32"))]
    {
        let f = &f;
        let res = crossbeam_utils::thread::scope(|scope| {
            for (i, chunk) in out.axis_chunks_iter_mut(Axis(0), chunk_channels).enumerate() {
                scope.spawn(move |_| f(i * chunk_channels, chunk));
            }
        });

        if let Err(panic) = res {
            std::panic::resume_unwind(panic);
        }
    }
}

fn conv_forward(ctx: &ComputeContext, conv: &ConvLayer, input: &Tensor) -> Tensor {
    let (_, h, w) = input.shape();
    let mut out = Tensor::zeros(conv.out_channels(), h, w);
    let src = input.view();

    for_each_channel_chunk(ctx, out.view_mut(), |first, mut chunk| {
        for (n, mut dst) in chunk.outer_iter_mut().enumerate() {
            let o = first + n;
            dst.fill(conv.bias[o]);

            for (i, plane) in src.outer_iter().enumerate() {
                let kernel = conv.weights.slice(s![o, i, .., ..]);
                for ((ky, kx), &wv) in kernel.indexed_iter() {
                    if wv == 0.0 {
                        continue;
                    }
                    accumulate_tap(&mut dst, &plane, wv, ky as isize - 1, kx as isize - 1);
                }
            }
        }
    });

    out
}

fn conv_backward_input(
    ctx: &ComputeContext,
    conv: &ConvLayer,
    grad_out: &Tensor,
    input_shape: (usize, usize, usize),
) -> Tensor {
    let (_, h, w) = input_shape;
    let mut grad_in = Tensor::zeros(conv.in_channels(), h, w);
    let src = grad_out.view();

    for_each_channel_chunk(ctx, grad_in.view_mut(), |first, mut chunk| {
        for (n, mut dst) in chunk.outer_iter_mut().enumerate() {
            let i = first + n;
            for (o, plane) in src.outer_iter().enumerate() {
                let kernel = conv.weights.slice(s![o, i, .., ..]);
                for ((ky, kx), &wv) in kernel.indexed_iter() {
                    if wv == 0.0 {
                        continue;
                    }
                    scatter_tap(&mut dst, &plane, wv, ky as isize - 1, kx as isize - 1);
                }
            }
        }
    });

    grad_in
}

/// Pooled extent of an axis: halved (floor), but never below 1
#[inline]
fn pooled_len(len: usize) -> usize {
    if len >= 2 {
        len / 2
    } else {
        len
    }
}

#[inline]
fn pool_window(o: usize, len: usize) -> std::ops::Range<usize> {
    2 * o..(2 * o + 2).min(len)
}

fn avg_pool(input: &Tensor) -> Tensor {
    let (c, h, w) = input.shape();
    let (oh, ow) = (pooled_len(h), pooled_len(w));
    let mut out = Tensor::zeros(c, oh, ow);

    for ch in 0..c {
        for oy in 0..oh {
            for ox in 0..ow {
                let mut sum = 0.0;
                let mut count = 0;
                for y in pool_window(oy, h) {
                    for x in pool_window(ox, w) {
                        sum += input.get(ch, y, x);
                        count += 1;
                    }
                }
                out.set(ch, oy, ox, sum / count as f32);
            }
        }
    }

    out
}

fn avg_pool_backward(grad_out: &Tensor, input_shape: (usize, usize, usize)) -> Tensor {
    let (c, h, w) = input_shape;
    let mut grad_in = Tensor::zeros(c, h, w);

    for ch in 0..c {
        for oy in 0..grad_out.height() {
            for ox in 0..grad_out.width() {
                let ys = pool_window(oy, h);
                let xs = pool_window(ox, w);
                let count = (ys.len() * xs.len()) as f32;
                let g = grad_out.get(ch, oy, ox) / count;
                for y in ys {
                    for x in xs.clone() {
                        let v = grad_in.get(ch, y, x);
                        grad_in.set(ch, y, x, v + g);
                    }
                }
            }
        }
    }

    grad_in
}

#[cfg(test)]
mod test {
    use super::*;

    fn tiny() -> ConvNet {
        ConvNet::from_layout(
            &[
                LayerSpec::Conv(4),
                LayerSpec::Pool,
                LayerSpec::Conv(5),
                LayerSpec::Conv(3),
            ],
            1,
            &[0, 2],
            7,
        )
        .unwrap()
    }

    fn image(h: usize, w: usize) -> Tensor {
        let data = (0..3 * h * w)
            .map(|i| ((i * 37 % 101) as f32 - 50.0) * 0.1)
            .collect();
        Tensor::from_vec(3, h, w, data).unwrap()
    }

    fn nudged(img: &Tensor, idx: usize, delta: f32) -> Tensor {
        let mut t = img.clone();
        if let Some(v) = t.iter_mut().nth(idx) {
            *v += delta;
        }
        t
    }

    /// A safetensors file assembled by hand, so headers the writer would
    /// never produce can be fed to the reader
    fn raw_safetensors(header: &str, data: &[u8]) -> Vec<u8> {
        let mut buffer = (header.len() as u64).to_le_bytes().to_vec();
        buffer.extend_from_slice(header.as_bytes());
        buffer.extend_from_slice(data);
        buffer
    }

    #[test]
    fn vgg19_layer_names() {
        let names = ConvNet::vgg19(0).unwrap().layer_names();
        assert_eq!(names.len(), 13);
        assert_eq!(names[VGG19_CONTENT_INDEX], "relu4_2");
        let style: Vec<_> = VGG19_STYLE_INDICES
            .iter()
            .map(|&i| names[i].as_str())
            .collect();
        assert_eq!(
            style,
            ["relu1_1", "relu2_1", "relu3_1", "relu4_1", "relu5_1"]
        );
    }

    #[test]
    fn rejects_out_of_range_indices() {
        assert!(matches!(
            ConvNet::from_layout(&[LayerSpec::Conv(2)], 1, &[], 0),
            Err(Error::LayerOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn activation_shapes() {
        let net = tiny();
        let acts = net
            .extract(&ComputeContext::single_threaded(), &image(5, 6))
            .unwrap();

        assert_eq!(acts.len(), 3);
        assert_eq!(acts.layer(0).unwrap().shape(), (4, 5, 6));
        assert_eq!(acts.layer(1).unwrap().shape(), (5, 2, 3));
        assert_eq!(acts.layer(2).unwrap().shape(), (3, 2, 3));
        assert!(acts.iter().all(|a| a.iter().all(|v| *v >= 0.0)));
    }

    #[test]
    fn threaded_matches_single_threaded() {
        let net = tiny();
        let img = image(6, 6);
        let single = net
            .extract(&ComputeContext::single_threaded(), &img)
            .unwrap();
        let multi = net.extract(&ComputeContext::new(3), &img).unwrap();

        for (a, b) in single.iter().zip(multi.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn pooling_odd_and_unit_sizes() {
        let t = Tensor::from_vec(1, 3, 1, vec![1.0, 3.0, 100.0]).unwrap();
        let p = avg_pool(&t);
        assert_eq!(p.shape(), (1, 1, 1));
        assert_eq!(p.get(0, 0, 0), 2.0);

        let g = avg_pool_backward(&Tensor::filled(1, 1, 1, 1.0), t.shape());
        assert_eq!(g.iter().copied().collect::<Vec<_>>(), [0.5, 0.5, 0.0]);
    }

    #[test]
    fn backprop_matches_finite_differences() {
        let net = tiny();
        let ctx = ComputeContext::single_threaded();
        let img = image(4, 4);

        // loss = sum(act[1]) + 0.5 * sum(act[2])
        let loss = |img: &Tensor| -> f64 {
            let acts = net.extract(&ctx, img).unwrap();
            let a: f64 = acts.layer(1).unwrap().iter().map(|v| f64::from(*v)).sum();
            let b: f64 = acts.layer(2).unwrap().iter().map(|v| f64::from(*v)).sum();
            a + 0.5 * b
        };

        let acts = net.extract(&ctx, &img).unwrap();
        let grads = vec![
            None,
            Some(Tensor::filled(5, 2, 2, 1.0)),
            Some(Tensor::filled(3, 2, 2, 0.5)),
        ];
        let analytic = net.backpropagate(&ctx, &img, &acts, &grads).unwrap();

        let eps = 1e-3;
        for idx in [0, 5, 17, 33, 47] {
            let plus = nudged(&img, idx, eps);
            let minus = nudged(&img, idx, -eps);

            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * f64::from(eps));
            let a = f64::from(analytic.iter().nth(idx).copied().unwrap());
            assert!(
                (numeric - a).abs() < 1e-2 * (1.0 + a.abs()),
                "index {}: numeric {} vs analytic {}",
                idx,
                numeric,
                a
            );
        }
    }

    #[test]
    fn no_grads_means_zero_image_grad() {
        let net = tiny();
        let ctx = ComputeContext::single_threaded();
        let img = image(4, 4);
        let acts = net.extract(&ctx, &img).unwrap();

        let g = net
            .backpropagate(&ctx, &img, &acts, &[None, None, None])
            .unwrap();
        assert!(g.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn weights_roundtrip() {
        let net = tiny();
        let mut buffer = Vec::new();
        let written = net.write(&mut buffer).unwrap();
        assert_eq!(written, buffer.len());

        let read = ConvNet::read(&mut std::io::Cursor::new(&buffer)).unwrap();
        assert_eq!(read.layer_names(), net.layer_names());
        assert_eq!(read.content_index(), 1);
        assert_eq!(read.style_indices(), &[0, 2]);

        let ctx = ComputeContext::single_threaded();
        let img = image(4, 4);
        let a = net.extract(&ctx, &img).unwrap();
        let b = read.extract(&ctx, &img).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x, y);
        }
    }

    #[test]
    fn rejects_garbage_and_truncation() {
        assert!(matches!(
            ConvNet::read(&mut &b"definitely not a weight file"[..]),
            Err(Error::InvalidWeights(_))
        ));

        let mut buffer = Vec::new();
        tiny().write(&mut buffer).unwrap();
        buffer.truncate(buffer.len() - 4);
        assert!(matches!(
            ConvNet::read(&mut std::io::Cursor::new(&buffer)),
            Err(Error::InvalidWeights(_))
        ));
    }

    #[test]
    fn rejects_shapes_larger_than_the_data() {
        let header = r#"{"__metadata__":{"layout":"conv","content_index":"0","style_indices":""},"features.0.weight":{"dtype":"F32","shape":[4294967295,3,3,3],"data_offsets":[0,4]},"features.0.bias":{"dtype":"F32","shape":[1],"data_offsets":[4,8]}}"#;
        let buffer = raw_safetensors(header, &[0u8; 8]);

        assert!(matches!(
            ConvNet::read(&mut buffer.as_slice()),
            Err(Error::InvalidWeights(_))
        ));
    }

    #[test]
    fn rejects_mismatched_input_channels() {
        let weights = vec![0u8; 4 * 2 * 9 * 4];
        let bias = vec![0u8; 4 * 4];
        let mut header = HashMap::new();
        header.insert(META_LAYOUT.to_owned(), "conv".to_owned());
        header.insert(META_CONTENT.to_owned(), "0".to_owned());
        let views = vec![
            (
                "features.0.weight",
                TensorView::new(Dtype::F32, vec![4, 2, 3, 3], &weights).unwrap(),
            ),
            (
                "features.0.bias",
                TensorView::new(Dtype::F32, vec![4], &bias).unwrap(),
            ),
        ];
        let buffer = safetensors::serialize(views, &Some(header)).unwrap();

        match ConvNet::read(&mut buffer.as_slice()) {
            Err(Error::InvalidWeights(msg)) => assert!(msg.contains("features.0.weight"), "{}", msg),
            other => panic!("expected invalid weights, got {:?}", other.map(|n| n.layer_names())),
        }
    }

    #[test]
    fn headerless_files_use_vgg19_names() {
        let prefixes = module_prefixes(VGG19.iter().map(|s| matches!(s, LayerSpec::Conv(_))));
        let convs: Vec<_> = VGG19
            .iter()
            .zip(&prefixes)
            .filter(|(s, _)| matches!(s, LayerSpec::Conv(_)))
            .map(|(_, p)| p.as_str())
            .collect();
        assert_eq!(
            convs,
            [
                "features.0",
                "features.2",
                "features.5",
                "features.7",
                "features.10",
                "features.12",
                "features.14",
                "features.16",
                "features.19",
                "features.21",
                "features.23",
                "features.25",
                "features.28",
            ]
        );

        // only the first convolution is present, so reading stops at the second
        let weights = vec![0u8; 64 * 3 * 9 * 4];
        let bias = vec![0u8; 64 * 4];
        let views = vec![
            (
                "features.0.weight",
                TensorView::new(Dtype::F32, vec![64, 3, 3, 3], &weights).unwrap(),
            ),
            (
                "features.0.bias",
                TensorView::new(Dtype::F32, vec![64], &bias).unwrap(),
            ),
        ];
        let buffer = safetensors::serialize(views, &None).unwrap();

        match ConvNet::read(&mut buffer.as_slice()) {
            Err(Error::InvalidWeights(msg)) => assert!(msg.contains("features.2.weight"), "{}", msg),
            other => panic!("expected invalid weights, got {:?}", other.map(|n| n.layer_names())),
        }
    }
}

//! Dense channels-first `f32` tensors, the only numeric container the
//! optimization core works with.

use crate::Error;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayViewMut3, Axis, Zip};

/// A `(channels, height, width)` tensor.
///
/// The backing array is always in standard (row major) layout, which lets a
/// tensor be viewed as a `C x (H·W)` matrix without copying.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Array3<f32>,
}

impl From<Array3<f32>> for Tensor {
    fn from(data: Array3<f32>) -> Self {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Self { data }
    }
}

impl Tensor {
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            data: Array3::zeros((channels, height, width)),
        }
    }

    pub fn filled(channels: usize, height: usize, width: usize, value: f32) -> Self {
        Self {
            data: Array3::from_elem((channels, height, width), value),
        }
    }

    /// Wraps an existing channel-major buffer, failing if its length doesn't
    /// match the shape
    pub fn from_vec(
        channels: usize,
        height: usize,
        width: usize,
        data: Vec<f32>,
    ) -> Result<Self, Error> {
        let actual = data.len();
        Array3::from_shape_vec((channels, height, width), data)
            .map(Self::from)
            .map_err(|_| Error::ShapeMismatch {
                expected: (channels, height, width),
                actual,
            })
    }

    /// A zeroed tensor with the same shape as `self`
    pub fn zeros_like(&self) -> Self {
        Self {
            data: Array3::zeros(self.data.raw_dim()),
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    /// `(channels, height, width)`
    #[inline]
    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Number of spatial positions in a single channel
    #[inline]
    pub fn plane_len(&self) -> usize {
        self.height() * self.width()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    #[inline]
    pub fn view_mut(&mut self) -> ArrayViewMut3<'_, f32> {
        self.data.view_mut()
    }

    /// Elements in channel-major order
    pub fn iter(&self) -> ndarray::iter::Iter<'_, f32, ndarray::Ix3> {
        self.data.iter()
    }

    pub fn iter_mut(&mut self) -> ndarray::iter::IterMut<'_, f32, ndarray::Ix3> {
        self.data.iter_mut()
    }

    #[inline]
    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[[c, y, x]]
    }

    #[inline]
    pub fn set(&mut self, c: usize, y: usize, x: usize, value: f32) {
        self.data[[c, y, x]] = value;
    }

    /// The `height x width` map of a single channel
    #[inline]
    pub fn channel(&self, c: usize) -> ArrayView2<'_, f32> {
        self.data.index_axis(Axis(0), c)
    }

    /// The tensor flattened to `channels x (height·width)`
    pub fn as_matrix(&self) -> Result<ArrayView2<'_, f32>, Error> {
        let (c, h, w) = self.shape();
        self.data
            .view()
            .into_shape((c, h * w))
            .map_err(|_| Error::ShapeMismatch {
                expected: (c, h, w),
                actual: self.len(),
            })
    }

    /// Inverse of [`Tensor::as_matrix`]
    pub fn from_matrix(
        matrix: Array2<f32>,
        height: usize,
        width: usize,
    ) -> Result<Self, Error> {
        let channels = matrix.nrows();
        let actual = matrix.len();
        let matrix = matrix.as_standard_layout().into_owned();
        matrix
            .into_shape((channels, height, width))
            .map(Self::from)
            .map_err(|_| Error::ShapeMismatch {
                expected: (channels, height, width),
                actual,
            })
    }

    pub fn same_shape(&self, other: &Self) -> bool {
        self.shape() == other.shape()
    }

    pub(crate) fn check_same_shape(&self, other: &Self) -> Result<(), Error> {
        if self.same_shape(other) {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                expected: self.shape(),
                actual: other.len(),
            })
        }
    }

    /// Adds `other * scale` into `self` element-wise
    pub fn add_scaled(&mut self, other: &Self, scale: f32) {
        debug_assert!(self.same_shape(other));
        self.data.scaled_add(scale, &other.data);
    }

    pub fn scale(&mut self, factor: f32) {
        self.data *= factor;
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// True if every element is finite
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Mean squared difference against a tensor of the same shape
    pub fn mse(&self, target: &Self) -> f64 {
        debug_assert!(self.same_shape(target));
        if self.data.is_empty() {
            return 0.0;
        }

        squared_error_sum(&self.data, &target.data) / self.data.len() as f64
    }

    /// Gradient of [`Tensor::mse`] with respect to `self`
    pub fn mse_grad(&self, target: &Self) -> Self {
        debug_assert!(self.same_shape(target));
        let scale = if self.data.is_empty() {
            0.0
        } else {
            2.0 / self.data.len() as f32
        };

        Self::from((&self.data - &target.data) * scale)
    }
}

/// A dense square matrix, used for Gram matrices.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    data: Array2<f32>,
}

impl Matrix {
    pub fn zeros(size: usize) -> Self {
        Self {
            data: Array2::zeros((size, size)),
        }
    }

    /// Wraps a square array
    pub fn from_array(data: Array2<f32>) -> Result<Self, Error> {
        let (rows, cols) = data.dim();
        if rows != cols {
            return Err(Error::ShapeMismatch {
                expected: (rows, rows, 1),
                actual: rows * cols,
            });
        }
        Ok(Self { data })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.nrows()
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[[row, col]]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[[row, col]] = value;
    }

    #[inline]
    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    pub fn transpose(&self) -> Self {
        Self {
            data: self.data.t().to_owned(),
        }
    }

    /// Mean squared difference against a matrix of the same size
    pub fn mse(&self, target: &Self) -> f64 {
        debug_assert_eq!(self.size(), target.size());
        if self.data.is_empty() {
            return 0.0;
        }

        squared_error_sum(&self.data, &target.data) / self.data.len() as f64
    }

    /// Gradient of [`Matrix::mse`] with respect to `self`
    pub fn mse_grad(&self, target: &Self) -> Self {
        debug_assert_eq!(self.size(), target.size());
        let scale = if self.data.is_empty() {
            0.0
        } else {
            2.0 / self.data.len() as f32
        };

        Self {
            data: (&self.data - &target.data) * scale,
        }
    }
}

fn squared_error_sum<D: ndarray::Dimension>(
    a: &ndarray::Array<f32, D>,
    b: &ndarray::Array<f32, D>,
) -> f64 {
    Zip::from(a).and(b).fold(0.0, |acc, &a, &b| {
        let d = f64::from(a) - f64::from(b);
        acc + d * d
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_vec_checks_len() {
        assert!(Tensor::from_vec(2, 2, 2, vec![0.0; 8]).is_ok());
        assert!(matches!(
            Tensor::from_vec(2, 2, 2, vec![0.0; 7]),
            Err(Error::ShapeMismatch { actual: 7, .. })
        ));
    }

    #[test]
    fn indexing_is_channel_major() {
        let t = Tensor::from_vec(2, 1, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(t.get(1, 0, 0), 3.0);
        assert_eq!(t.channel(1), ndarray::arr2(&[[3.0f32, 4.0]]));
        assert_eq!(t.iter().copied().collect::<Vec<_>>(), [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn matrix_view_roundtrips() {
        let t = Tensor::from_vec(2, 2, 3, (0..12).map(|v| v as f32).collect()).unwrap();
        let m = t.as_matrix().unwrap();
        assert_eq!(m.dim(), (2, 6));
        assert_eq!(m[[1, 0]], 6.0);

        let back = Tensor::from_matrix(m.to_owned(), 2, 3).unwrap();
        assert_eq!(back, t);
        assert!(Tensor::from_matrix(m.to_owned(), 4, 3).is_err());
    }

    #[test]
    fn non_standard_arrays_are_normalized() {
        let transposed = Array3::from_shape_fn((2, 3, 4), |(c, y, x)| (c * 100 + y * 10 + x) as f32)
            .reversed_axes();
        let t = Tensor::from(transposed);
        assert_eq!(t.shape(), (4, 3, 2));
        assert_eq!(t.get(3, 2, 1), 123.0);
        assert!(t.as_matrix().is_ok());
    }

    #[test]
    fn mse_and_grad() {
        let a = Tensor::from_vec(1, 1, 2, vec![1.0, 3.0]).unwrap();
        let b = Tensor::from_vec(1, 1, 2, vec![0.0, 1.0]).unwrap();

        // ((1)^2 + (2)^2) / 2
        assert!((a.mse(&b) - 2.5).abs() < 1e-9);
        assert_eq!(a.mse_grad(&b).iter().copied().collect::<Vec<_>>(), [1.0, 2.0]);
        assert_eq!(a.mse(&a), 0.0);
    }

    #[test]
    fn matrix_mse_grad() {
        let mut a = Matrix::zeros(2);
        a.set(0, 1, 2.0);
        let b = Matrix::zeros(2);

        assert_eq!(a.mse(&b), 1.0);
        let g = a.mse_grad(&b);
        assert_eq!(g.get(0, 1), 1.0);
        assert_eq!(g.get(1, 0), 0.0);
        assert!(Matrix::from_array(Array2::zeros((2, 3))).is_err());
    }
}

//! Parameter tensor with gradient storage
//!
//! Every trainable or frozen matrix in a model is a [`Tensor`]. Gradients are
//! written by the model's backward pass and consumed by optimizers.

use ndarray::Array2;

/// Dense 2-D parameter with an optional accumulated gradient
#[derive(Clone)]
pub struct Tensor {
    data: Array2<f32>,
    grad: Option<Array2<f32>>,
    requires_grad: bool,
}

impl Tensor {
    /// Create a new tensor with data
    pub fn new(data: Array2<f32>, requires_grad: bool) -> Self {
        Self {
            data,
            grad: None,
            requires_grad,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(rows: usize, cols: usize, requires_grad: bool) -> Self {
        Self::new(Array2::zeros((rows, cols)), requires_grad)
    }

    /// Get reference to data
    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    /// Get mutable reference to data
    pub fn data_mut(&mut self) -> &mut Array2<f32> {
        &mut self.data
    }

    /// Consume the tensor and return its data
    pub fn into_data(self) -> Array2<f32> {
        self.data
    }

    /// `[rows, cols]`
    pub fn shape(&self) -> [usize; 2] {
        let (r, c) = self.data.dim();
        [r, c]
    }

    /// Get gradient (if computed)
    pub fn grad(&self) -> Option<&Array2<f32>> {
        self.grad.as_ref()
    }

    pub fn grad_mut(&mut self) -> Option<&mut Array2<f32>> {
        self.grad.as_mut()
    }

    /// Set gradient
    pub fn set_grad(&mut self, grad: Array2<f32>) {
        self.grad = Some(grad);
    }

    /// Accumulate gradient (micro-batches add into the same buffer)
    pub fn accumulate_grad(&mut self, grad: Array2<f32>) {
        match self.grad.as_mut() {
            Some(existing) => *existing += &grad,
            None => self.grad = Some(grad),
        }
    }

    /// Zero out gradient
    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    /// Check if requires gradient
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Number of scalar elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape())
            .field("has_grad", &self.grad.is_some())
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}

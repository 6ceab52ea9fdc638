//! Position-wise feed-forward network.

use anyhow::Result;
use ndarray::Array3;

use crate::activations::{apply_activation_2d, Activation};
use crate::linear_layer::LinearLayer;

#[derive(Debug)]
pub struct FeedForward {
    fc1: LinearLayer,
    fc2: LinearLayer,
    activation: Activation,
}

impl FeedForward {
    pub fn new(
        fc1: impl Into<LinearLayer>,
        fc2: impl Into<LinearLayer>,
        activation: Activation,
    ) -> Self {
        Self {
            fc1: fc1.into(),
            fc2: fc2.into(),
            activation,
        }
    }

    /// Freshly initialized FFN for trainable sub-networks.
    pub fn xavier(hidden_size: usize, intermediate_size: usize, activation: Activation) -> Self {
        Self {
            fc1: LinearLayer::xavier(intermediate_size, hidden_size),
            fc2: LinearLayer::xavier(hidden_size, intermediate_size),
            activation,
        }
    }

    pub fn forward(&self, hidden: &Array3<f32>) -> Result<Array3<f32>> {
        let (batch, seq, _) = hidden.dim();

        let hidden_contig = hidden.as_standard_layout();
        let hidden_2d = hidden_contig
            .view()
            .into_shape_with_order((batch * seq, hidden.shape()[2]))?;

        let mut intermediate = self.fc1.matmul(&hidden_2d);
        apply_activation_2d(&mut intermediate, self.activation);

        let output = self.fc2.matmul(&intermediate.view());

        Ok(output.into_shape_with_order((batch, seq, self.fc2.out_features()))?)
    }

    pub fn hidden_size(&self) -> usize {
        self.fc1.in_features()
    }

    pub fn intermediate_size(&self) -> usize {
        self.fc1.out_features()
    }

    pub fn fc1(&self) -> &LinearLayer {
        &self.fc1
    }

    pub fn fc2(&self) -> &LinearLayer {
        &self.fc2
    }
}

//! Dense matrix multiplication built on faer.
//!
//! Weight matrices follow the `[OutFeatures, InFeatures]` layout used by
//! safetensors checkpoints, so the workhorse here is the transposed variant.

use faer::Parallelism;
use ndarray::{Array2, Array3, Array4, ArrayView2, Zip};

#[inline]
pub fn matmul_2d(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Array2<f32> {
    let (m, k) = a.dim();
    let (k2, n) = b.dim();
    assert_eq!(k, k2, "matmul inner dimensions do not match");

    let mut c = Array2::<f32>::zeros((m, n));
    let a_s = a.as_standard_layout();
    let b_s = b.as_standard_layout();
    let c_sl = c.as_slice_mut().unwrap();

    faer::linalg::matmul::matmul(
        faer::mat::from_row_major_slice_mut(c_sl, m, n),
        faer::mat::from_row_major_slice(a_s.as_slice().unwrap(), m, k),
        faer::mat::from_row_major_slice(b_s.as_slice().unwrap(), k, n),
        None,
        1.0,
        Parallelism::Rayon(0),
    );
    c
}

/// `a @ b^T` where `b_transposed` is stored as `[Out, In]`.
#[inline]
pub fn matmul_2d_transposed(a: &ArrayView2<f32>, b_transposed: &ArrayView2<f32>) -> Array2<f32> {
    let (m, k) = a.dim();
    let (n, k2) = b_transposed.dim();
    assert_eq!(k, k2, "matmul inner dimensions do not match");

    let mut c = Array2::<f32>::zeros((m, n));
    let a_s = a.as_standard_layout();
    let b_s = b_transposed.as_standard_layout();
    let c_sl = c.as_slice_mut().unwrap();

    faer::linalg::matmul::matmul(
        faer::mat::from_row_major_slice_mut(c_sl, m, n),
        faer::mat::from_row_major_slice(a_s.as_slice().unwrap(), m, k),
        faer::mat::from_row_major_slice(b_s.as_slice().unwrap(), n, k).transpose(),
        None,
        1.0,
        Parallelism::Rayon(0),
    );
    c
}

#[inline]
pub fn matmul_3d_2d(a: &Array3<f32>, b: &Array2<f32>) -> Array3<f32> {
    let (batch, m, k) = a.dim();
    let (k2, n) = b.dim();
    assert_eq!(k, k2);
    let a_c = a.as_standard_layout();
    let a_flat = a_c.view().into_shape_with_order((batch * m, k)).unwrap();
    let c_flat = matmul_2d(&a_flat, &b.view());
    c_flat.into_shape_with_order((batch, m, n)).unwrap()
}

/// 3D input against a 2D weight matrix in `[Out, In]` layout.
#[inline]
pub fn matmul_3d_2d_transposed(a: &Array3<f32>, b_transposed: &Array2<f32>) -> Array3<f32> {
    let (batch, m, k) = a.dim();
    let (n, k2) = b_transposed.dim();
    assert_eq!(k, k2, "matmul inner dimensions do not match");

    let a_c = a.as_standard_layout();
    let a_flat = a_c.view().into_shape_with_order((batch * m, k)).unwrap();
    let c_flat = matmul_2d_transposed(&a_flat, &b_transposed.view());
    c_flat.into_shape_with_order((batch, m, n)).unwrap()
}

/// Batched per-head matmul: `[B, H, M, K] @ [B, H, K, N] -> [B, H, M, N]`.
#[inline]
pub fn matmul_4d(a: &Array4<f32>, b: &Array4<f32>) -> Array4<f32> {
    let (batch, heads, seq1, dim) = a.dim();
    let seq2 = b.shape()[3];

    let mut output = Array4::<f32>::zeros((batch, heads, seq1, seq2));

    Zip::from(output.outer_iter_mut())
        .and(a.outer_iter())
        .and(b.outer_iter())
        .par_for_each(|mut out_b, a_b, b_b| {
            Zip::from(out_b.outer_iter_mut())
                .and(a_b.outer_iter())
                .and(b_b.outer_iter())
                .for_each(|mut out_h, a_h, b_h| {
                    let a_s = a_h.as_standard_layout();
                    let b_s = b_h.as_standard_layout();
                    let o_s = out_h
                        .as_slice_mut()
                        .expect("output buffer must be contiguous");

                    faer::linalg::matmul::matmul(
                        faer::mat::from_row_major_slice_mut(o_s, seq1, seq2),
                        faer::mat::from_row_major_slice(a_s.as_slice().unwrap(), seq1, dim),
                        faer::mat::from_row_major_slice(b_s.as_slice().unwrap(), dim, seq2),
                        None,
                        1.0,
                        Parallelism::None, // outer Zip is already parallel
                    );
                });
        });

    output
}

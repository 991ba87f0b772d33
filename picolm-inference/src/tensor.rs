use rayon::prelude::*;
use std::borrow::Cow;

/// Rows per pruning tile of a block-sparse weight matrix.
pub const BLOCK_R: usize = 4;
/// Columns per pruning tile of a block-sparse weight matrix.
pub const BLOCK_C: usize = 4;

/// int8 quantization range.
const Q_MAX: f32 = 127.0;
/// Guard added to activation scales so an all-zero input still divides cleanly.
const SCALE_EPS: f32 = 1e-8;
/// Variance epsilon for layer normalization.
const LN_EPS: f32 = 1e-5;
/// Rotary embedding base frequency.
const ROPE_BASE: f32 = 10000.0;

/// Sparsity layout of a weight matrix, fixed when the tensor is loaded.
///
/// `BlockSparse` carries one bit per `BLOCK_R x BLOCK_C` tile, packed eight
/// tiles per byte in row-major tile order (bit index = tile index mod 8).
/// A cleared bit marks the tile as exact zero; its elements are never read.
#[derive(Debug, Clone)]
pub enum Layout<'a> {
    Dense,
    BlockSparse(Cow<'a, [u8]>),
}

/// A quantized weight matrix: row-major int8 data plus one f32 dequantization
/// scale.
///
/// The data may borrow the page buffer it was read from (zero-copy) or own a
/// detached copy. Borrowed views keep the page store mutably borrowed, so the
/// compiler rejects any further page read while the view is alive; call
/// [`QTensor::into_owned`] to keep a tensor past the next read.
#[derive(Debug, Clone)]
pub struct QTensor<'a> {
    pub data: Cow<'a, [i8]>,
    pub scale: f32,
    pub rows: usize,
    pub cols: usize,
    pub layout: Layout<'a>,
}

impl<'a> QTensor<'a> {
    pub fn dense(data: impl Into<Cow<'a, [i8]>>, scale: f32, rows: usize, cols: usize) -> Self {
        let data = data.into();
        debug_assert!(data.len() >= rows * cols);
        Self { data, scale, rows, cols, layout: Layout::Dense }
    }

    pub fn block_sparse(
        data: impl Into<Cow<'a, [i8]>>,
        scale: f32,
        rows: usize,
        cols: usize,
        mask: impl Into<Cow<'a, [u8]>>,
    ) -> Self {
        let data = data.into();
        let mask = mask.into();
        debug_assert!(data.len() >= rows * cols);
        debug_assert!(mask.len() * 8 >= tile_grid(rows, cols).0 * tile_grid(rows, cols).1);
        Self { data, scale, rows, cols, layout: Layout::BlockSparse(mask) }
    }

    /// Detaches the tensor from whatever buffer it borrows.
    pub fn into_owned(self) -> QTensor<'static> {
        QTensor {
            data: Cow::Owned(self.data.into_owned()),
            scale: self.scale,
            rows: self.rows,
            cols: self.cols,
            layout: match self.layout {
                Layout::Dense => Layout::Dense,
                Layout::BlockSparse(mask) => Layout::BlockSparse(Cow::Owned(mask.into_owned())),
            },
        }
    }

    pub fn is_masked(&self) -> bool {
        matches!(self.layout, Layout::BlockSparse(_))
    }
}

/// Tile grid dimensions for a `rows x cols` matrix (boundary tiles included).
pub(crate) fn tile_grid(rows: usize, cols: usize) -> (usize, usize) {
    (rows.div_ceil(BLOCK_R), cols.div_ceil(BLOCK_C))
}

/// Number of mask bytes a `rows x cols` block-sparse matrix needs.
pub fn mask_len(rows: usize, cols: usize) -> usize {
    let (brow, bcol) = tile_grid(rows, cols);
    (brow * bcol).div_ceil(8)
}

/// Quantizes an activation vector to int8 with a per-call dynamic range scale.
///
/// Returns the scale: `max(|x|) / 127 + eps`. Values round to nearest and
/// saturate at the int8 range.
pub fn quantize_activation(x: &[f32], q: &mut [i8]) -> f32 {
    debug_assert!(q.len() >= x.len());
    let xmax = x.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
    let scale = xmax / Q_MAX + SCALE_EPS;
    for (qv, &v) in q.iter_mut().zip(x.iter()) {
        *qv = (v / scale).round() as i8;
    }
    scale
}

/// Expands int8 data back to f32 using a single scale.
pub fn dequantize(q: &[i8], scale: f32, out: &mut [f32]) {
    debug_assert!(out.len() >= q.len());
    for (o, &v) in out.iter_mut().zip(q.iter()) {
        *o = v as f32 * scale;
    }
}

/// Dense int8 matmul: `C[M x N] = A[M x K] * B[K x N]`.
///
/// Each output element accumulates in i32 and is scaled back by one float
/// multiply at the end; quantization error stays confined to that single
/// scale-back step.
pub fn matmul_dense(
    a: &[i8],
    a_scale: f32,
    b: &[i8],
    b_scale: f32,
    m: usize,
    k: usize,
    n: usize,
    out: &mut [f32],
) {
    assert!(a.len() >= m * k, "lhs too small: {} < {}", a.len(), m * k);
    assert!(b.len() >= k * n, "rhs too small: {} < {}", b.len(), k * n);
    assert!(out.len() >= m * n, "output too small: {} < {}", out.len(), m * n);

    let combined = a_scale * b_scale;
    for (row_idx, row) in out.chunks_mut(n).take(m).enumerate() {
        let a_row = &a[row_idx * k..row_idx * k + k];
        row.par_iter_mut().enumerate().for_each(|(col, out_val)| {
            let mut acc = 0i32;
            for (kk, &av) in a_row.iter().enumerate() {
                acc += av as i32 * b[kk * n + col] as i32;
            }
            *out_val = combined * acc as f32;
        });
    }
}

/// Block-sparse int8 matmul: `C[M x N] = A[M x K] * B`, skipping masked tiles.
///
/// `b` must carry a `BlockSparse` layout; tiles whose mask bit is cleared
/// contribute nothing and their elements are never read. Boundary tiles are
/// clipped to the remaining rows/columns. Output is fully rewritten.
pub fn matmul_block_sparse(a: &[i8], a_scale: f32, b: &QTensor<'_>, m: usize, out: &mut [f32]) {
    let (k, n) = (b.rows, b.cols);
    let Layout::BlockSparse(mask) = &b.layout else {
        panic!("matmul_block_sparse called on a dense tensor");
    };
    assert!(a.len() >= m * k, "lhs too small: {} < {}", a.len(), m * k);
    assert!(out.len() >= m * n, "output too small: {} < {}", out.len(), m * n);

    let (brow, bcol) = tile_grid(k, n);
    let combined = a_scale * b.scale;

    for (row_idx, row) in out.chunks_mut(n).take(m).enumerate() {
        let a_row = &a[row_idx * k..row_idx * k + k];
        // Tile columns own disjoint output slices, so they can run in parallel;
        // tile rows accumulate sequentially into the same slice.
        row.par_chunks_mut(BLOCK_C).enumerate().for_each(|(bj, chunk)| {
            chunk.fill(0.0);
            let c0 = bj * BLOCK_C;
            for bi in 0..brow {
                let block_id = bi * bcol + bj;
                if mask[block_id >> 3] >> (block_id & 7) & 1 == 0 {
                    continue;
                }
                let r0 = bi * BLOCK_R;
                let rlen = BLOCK_R.min(k - r0);
                for (c, out_val) in chunk.iter_mut().enumerate() {
                    let mut acc = 0i32;
                    for r in 0..rlen {
                        acc += a_row[r0 + r] as i32 * b.data[(r0 + r) * n + (c0 + c)] as i32;
                    }
                    *out_val += combined * acc as f32;
                }
            }
        });
    }
}

/// Single-vector quantized linear layer: quantize `x`, then multiply through
/// `w`, dispatching on the tensor's sparsity layout.
pub fn linear(x: &[f32], w: &QTensor<'_>, xq: &mut [i8], out: &mut [f32]) {
    assert_eq!(x.len(), w.rows, "input length does not match weight rows");
    assert!(out.len() >= w.cols, "output shorter than weight cols");

    let scale = quantize_activation(x, &mut xq[..x.len()]);
    match &w.layout {
        Layout::Dense => {
            matmul_dense(&xq[..x.len()], scale, &w.data, w.scale, 1, w.rows, w.cols, out)
        }
        Layout::BlockSparse(_) => matmul_block_sparse(&xq[..x.len()], scale, w, 1, out),
    }
}

/// In-place layer normalization with learned gain and bias.
pub fn layer_norm(x: &mut [f32], gain: &[f32], bias: &[f32]) {
    debug_assert_eq!(x.len(), gain.len());
    debug_assert_eq!(x.len(), bias.len());

    let n = x.len() as f32;
    let mean = x.iter().sum::<f32>() / n;
    let var = x.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let inv = 1.0 / (var + LN_EPS).sqrt();

    for ((v, &g), &b) in x.iter_mut().zip(gain.iter()).zip(bias.iter()) {
        *v = (*v - mean) * inv * g + b;
    }
}

/// In-place numerically stable softmax.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let sum = x
        .iter_mut()
        .map(|v| {
            *v = (*v - max_val).exp();
            *v
        })
        .sum::<f32>();
    let inv = sum.recip();
    x.iter_mut().for_each(|v| *v *= inv);
}

/// Rotates adjacent (even, odd) pairs of the query and key vectors by a
/// position-dependent angle: `pos * ROPE_BASE^(-i/d)` for pair base index `i`.
pub fn rope_apply(q: &mut [f32], k: &mut [f32], pos: usize) {
    debug_assert_eq!(q.len(), k.len());
    debug_assert_eq!(q.len() % 2, 0);

    let d = q.len() as f32;
    for i in (0..q.len()).step_by(2) {
        let theta = ROPE_BASE.powf(-(i as f32) / d);
        let angle = pos as f32 * theta;
        let (sin, cos) = angle.sin_cos();

        let (q0, q1) = (q[i], q[i + 1]);
        q[i] = q0 * cos - q1 * sin;
        q[i + 1] = q0 * sin + q1 * cos;

        let (k0, k1) = (k[i], k[i + 1]);
        k[i] = k0 * cos - k1 * sin;
        k[i + 1] = k0 * sin + k1 * cos;
    }
}

/// GELU activation, tanh approximation.
pub fn gelu(v: f32) -> f32 {
    0.5 * v * (1.0 + (0.7978845608 * (v + 0.044715 * v * v * v)).tanh())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_ones_mask(rows: usize, cols: usize) -> Vec<u8> {
        vec![0xFF; mask_len(rows, cols)]
    }

    #[test]
    fn quantize_round_trips_within_one_step() {
        let x = [0.5f32, -1.25, 0.03, 2.0, -0.75, 1.5, 0.0, -2.0];
        let mut q = [0i8; 8];
        let scale = quantize_activation(&x, &mut q);

        let mut back = [0f32; 8];
        dequantize(&q, scale, &mut back);

        for (orig, rec) in x.iter().zip(back.iter()) {
            assert!((orig - rec).abs() <= scale, "|{orig} - {rec}| > {scale}");
        }

        // The max-magnitude element defines the range, so its rounding error
        // is at most half a step.
        let max_idx = 7;
        assert!((x[max_idx] - back[max_idx]).abs() <= scale / 2.0);
    }

    #[test]
    fn dense_and_all_ones_mask_agree() {
        let k = 6;
        let n = 10;
        let a: Vec<i8> = (0..k).map(|i| (i as i8) - 3).collect();
        let b_data: Vec<i8> = (0..k * n).map(|i| ((i * 7 % 23) as i8) - 11).collect();

        let mut dense_out = vec![0.0f32; n];
        matmul_dense(&a, 0.05, &b_data, 0.02, 1, k, n, &mut dense_out);

        let b = QTensor::block_sparse(b_data.clone(), 0.02, k, n, all_ones_mask(k, n));
        let mut sparse_out = vec![0.0f32; n];
        matmul_block_sparse(&a, 0.05, &b, 1, &mut sparse_out);

        for (d, s) in dense_out.iter().zip(sparse_out.iter()) {
            assert!((d - s).abs() < 1e-6, "dense {d} != sparse {s}");
        }
    }

    #[test]
    fn cleared_tile_contributes_exactly_zero() {
        let k = 8;
        let n = 8;
        let a: Vec<i8> = (0..k).map(|i| i as i8 + 1).collect();
        let b_data: Vec<i8> = (0..k * n).map(|i| (i % 13) as i8 - 6).collect();

        // Clear tile (bi=1, bj=0): rows 4..8, cols 0..4.
        let mut mask = all_ones_mask(k, n);
        let (_, bcol) = tile_grid(k, n);
        let cleared = bcol;
        mask[cleared >> 3] &= !(1 << (cleared & 7));

        let b = QTensor::block_sparse(b_data.clone(), 1.0, k, n, mask);
        let mut sparse_out = vec![0.0f32; n];
        matmul_block_sparse(&a, 1.0, &b, 1, &mut sparse_out);

        // Dense reference with the cleared tile's source values zeroed.
        let mut zeroed = b_data;
        for r in 4..8 {
            for c in 0..4 {
                zeroed[r * n + c] = 0;
            }
        }
        let mut dense_out = vec![0.0f32; n];
        matmul_dense(&a, 1.0, &zeroed, 1.0, 1, k, n, &mut dense_out);

        for (d, s) in dense_out.iter().zip(sparse_out.iter()) {
            assert!((d - s).abs() < 1e-6);
        }
    }

    #[test]
    fn boundary_tiles_are_clipped() {
        // 5x6 matrix: tile grid is 2x2 with ragged edges on both axes.
        let k = 5;
        let n = 6;
        let a: Vec<i8> = vec![1, -2, 3, -4, 5];
        let b_data: Vec<i8> = (0..k * n).map(|i| (i as i8 % 9) - 4).collect();

        let mut dense_out = vec![0.0f32; n];
        matmul_dense(&a, 1.0, &b_data, 1.0, 1, k, n, &mut dense_out);

        let b = QTensor::block_sparse(b_data, 1.0, k, n, all_ones_mask(k, n));
        let mut sparse_out = vec![0.0f32; n];
        matmul_block_sparse(&a, 1.0, &b, 1, &mut sparse_out);

        assert_eq!(dense_out, sparse_out);
    }

    #[test]
    fn layer_norm_normalizes_before_gain_bias() {
        let mut x = [3.0f32, -1.0, 4.0, 1.5, -9.2, 2.6, 5.3, -5.8];
        let gain = [1.0f32; 8];
        let bias = [0.0f32; 8];
        layer_norm(&mut x, &gain, &bias);

        let mean = x.iter().sum::<f32>() / 8.0;
        let var = x.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / 8.0;
        assert!(mean.abs() < 1e-5, "mean {mean}");
        assert!((var - 1.0).abs() < 1e-3, "var {var}");
    }

    #[test]
    fn softmax_sums_to_one_and_is_shift_invariant() {
        let mut a = [0.3f32, -1.2, 2.5, 0.0, 1.1];
        let mut b = a.map(|v| v + 42.0);
        softmax(&mut a);
        softmax(&mut b);

        assert!((a.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn rope_at_position_zero_is_identity() {
        let mut q = [1.0f32, 2.0, 3.0, 4.0];
        let mut k = [5.0f32, 6.0, 7.0, 8.0];
        rope_apply(&mut q, &mut k, 0);
        assert_eq!(q, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(k, [5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn rope_rotates_first_pair_by_position() {
        // Pair base index 0 has theta = 1, so the first pair rotates by `pos`
        // radians exactly.
        let mut q = [1.0f32, 0.0, 0.0, 0.0];
        let mut k = [0.0f32, 1.0, 0.0, 0.0];
        rope_apply(&mut q, &mut k, 2);

        let (sin, cos) = 2.0f32.sin_cos();
        assert!((q[0] - cos).abs() < 1e-6);
        assert!((q[1] - sin).abs() < 1e-6);
        assert!((k[0] + sin).abs() < 1e-6);
        assert!((k[1] - cos).abs() < 1e-6);
    }

    #[test]
    fn gelu_reference_points() {
        assert_eq!(gelu(0.0), 0.0);
        assert!((gelu(10.0) - 10.0).abs() < 1e-4);
        assert!(gelu(-10.0).abs() < 1e-4);
        // tanh approximation of GELU(1) ~ 0.8412
        assert!((gelu(1.0) - 0.8412).abs() < 1e-3);
    }

    #[test]
    fn linear_dispatches_on_layout() {
        let x = [1.0f32, -0.5, 0.25, 0.75];
        let w_data: Vec<i8> = (0..4 * 3).map(|i| (i as i8) - 6).collect();
        let mut xq = [0i8; 4];

        let dense = QTensor::dense(w_data.clone(), 0.1, 4, 3);
        let mut y_dense = [0.0f32; 3];
        linear(&x, &dense, &mut xq, &mut y_dense);

        let masked = QTensor::block_sparse(w_data, 0.1, 4, 3, all_ones_mask(4, 3));
        let mut y_masked = [0.0f32; 3];
        linear(&x, &masked, &mut xq, &mut y_masked);

        for (d, m) in y_dense.iter().zip(y_masked.iter()) {
            assert!((d - m).abs() < 1e-6);
        }
    }
}

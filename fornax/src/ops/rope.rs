//! Rotary position embeddings, interleaved-pair layout.
//!
//! The llama2.c weight format trains with adjacent element pairs
//! `(2i, 2i+1)` rotated together, so the kernel uses that layout rather
//! than the half-rotation variant used by HF checkpoints.

/// Rotate query and key vectors in place for sequence position `pos`.
///
/// `q` holds `n_heads * head_dim` floats, `k` holds
/// `n_kv_heads * head_dim`; the same per-pair angle applies to every head.
#[allow(clippy::cast_precision_loss)]
pub fn apply_rope(
    q: &mut [f32],
    k: &mut [f32],
    pos: usize,
    head_dim: usize,
    n_heads: usize,
    n_kv_heads: usize,
    theta: f32,
) {
    debug_assert_eq!(q.len(), n_heads * head_dim);
    debug_assert_eq!(k.len(), n_kv_heads * head_dim);

    for i in (0..head_dim).step_by(2) {
        let freq = 1.0 / theta.powf(i as f32 / head_dim as f32);
        let angle = pos as f32 * freq;
        let cos = angle.cos();
        let sin = angle.sin();

        for h in 0..n_heads {
            let base = h * head_dim + i;
            let v0 = q[base];
            let v1 = q[base + 1];
            q[base] = v0 * cos - v1 * sin;
            q[base + 1] = v0 * sin + v1 * cos;
        }

        for h in 0..n_kv_heads {
            let base = h * head_dim + i;
            let v0 = k[base];
            let v1 = k[base + 1];
            k[base] = v0 * cos - v1 * sin;
            k[base + 1] = v0 * sin + v1 * cos;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_zero_is_identity() {
        let mut q = vec![1.0, 2.0, 3.0, 4.0];
        let mut k = vec![5.0, 6.0];
        let q_orig = q.clone();
        let k_orig = k.clone();

        apply_rope(&mut q, &mut k, 0, 2, 2, 1, 10_000.0);
        assert_eq!(q, q_orig);
        assert_eq!(k, k_orig);
    }

    #[test]
    fn rotation_preserves_pair_norm() {
        let mut q = vec![0.6, 0.8, -1.0, 2.0];
        let mut k = vec![1.0, 0.0];
        apply_rope(&mut q, &mut k, 17, 2, 2, 1, 10_000.0);

        assert!((q[0].hypot(q[1]) - 1.0).abs() < 1e-5);
        assert!((q[2].hypot(q[3]) - 5.0f32.sqrt()).abs() < 1e-5);
        assert!((k[0].hypot(k[1]) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn first_pair_rotates_by_position() {
        // For dimension index 0, freq = 1, so the angle equals pos.
        let mut q = vec![1.0, 0.0];
        let mut k = vec![1.0, 0.0];
        apply_rope(&mut q, &mut k, 2, 2, 1, 1, 10_000.0);
        assert!((q[0] - 2.0f32.cos()).abs() < 1e-6);
        assert!((q[1] - 2.0f32.sin()).abs() < 1e-6);
    }
}

//! Matrix-vector product against row-major weights.

/// `out[i] = dot(input, weight[i])` for `weight` stored row-major as
/// `[out_dim, in_dim]`.
pub fn matmul(out: &mut [f32], input: &[f32], weight: &[f32], in_dim: usize, out_dim: usize) {
    debug_assert_eq!(input.len(), in_dim);
    debug_assert!(out.len() >= out_dim);
    debug_assert_eq!(weight.len(), in_dim * out_dim);

    for (i, out_val) in out.iter_mut().take(out_dim).enumerate() {
        let row = &weight[i * in_dim..(i + 1) * in_dim];
        let mut acc = 0.0f32;
        for j in 0..in_dim {
            acc += input[j] * row[j];
        }
        *out_val = acc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity() {
        let weight = [1.0, 0.0, 0.0, 1.0]; // 2x2 identity
        let input = [3.0, 7.0];
        let mut out = [0.0; 2];
        matmul(&mut out, &input, &weight, 2, 2);
        assert_eq!(out, [3.0, 7.0]);
    }

    #[test]
    fn rectangular() {
        // weight: [3, 2] rows (1,2), (3,4), (5,6)
        let weight = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let input = [1.0, 1.0];
        let mut out = [0.0; 3];
        matmul(&mut out, &input, &weight, 2, 3);
        assert_eq!(out, [3.0, 7.0, 11.0]);
    }
}

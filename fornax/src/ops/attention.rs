//! Single-query attention over a cached key/value history.
//!
//! Both kernels compute, for each query head `h` with grouped KV head
//! `kv_h = h / (n_heads / n_kv_heads)`:
//!
//! 1. scores: `score[t] = <q_h, k_{t, kv_h}> / sqrt(head_dim)` for
//!    `t = 0..num_tokens`
//! 2. numerically stable softmax over `t`
//! 3. `out_h = sum_t prob[t] * v_{t, kv_h}`
//!
//! Summation order is strictly `t = 0..num_tokens-1`, so results are
//! reproducible across runs. They differ only in how position `t` is
//! located: the paged kernel indirects through a block table, the
//! contiguous kernel indexes positions directly.

/// Attention over a paged KV history.
///
/// `k_pool`/`v_pool` are one layer's base slices of layout
/// `[num_blocks, block_size, n_kv_heads, head_dim]`; `block_table` maps
/// logical block `t / block_size` to a physical block. `scores` is scratch
/// for at least `n_heads * num_tokens` floats; `out` receives
/// `n_heads * head_dim` floats and is overwritten.
#[allow(clippy::too_many_arguments, clippy::cast_precision_loss)]
pub fn paged_attention(
    out: &mut [f32],
    q: &[f32],
    k_pool: &[f32],
    v_pool: &[f32],
    block_table: &[usize],
    scores: &mut [f32],
    num_tokens: usize,
    block_size: usize,
    head_dim: usize,
    n_heads: usize,
    n_kv_heads: usize,
) {
    let kv_mul = n_heads / n_kv_heads;
    let kv_dim = n_kv_heads * head_dim;
    let scale = 1.0 / (head_dim as f32).sqrt();

    out[..n_heads * head_dim].fill(0.0);

    for h in 0..n_heads {
        let q_head = &q[h * head_dim..(h + 1) * head_dim];
        let att = &mut scores[h * num_tokens..(h + 1) * num_tokens];
        let kv_h = h / kv_mul;

        for (t, att_t) in att.iter_mut().enumerate() {
            let physical_block = block_table[t / block_size];
            let offset =
                (physical_block * block_size + t % block_size) * kv_dim + kv_h * head_dim;
            let k_head = &k_pool[offset..offset + head_dim];

            let mut score = 0.0f32;
            for i in 0..head_dim {
                score += q_head[i] * k_head[i];
            }
            *att_t = score * scale;
        }

        super::softmax(att);

        let out_head = &mut out[h * head_dim..(h + 1) * head_dim];
        for (t, &prob) in att.iter().enumerate() {
            let physical_block = block_table[t / block_size];
            let offset =
                (physical_block * block_size + t % block_size) * kv_dim + kv_h * head_dim;
            let v_head = &v_pool[offset..offset + head_dim];
            for i in 0..head_dim {
                out_head[i] += prob * v_head[i];
            }
        }
    }
}

/// Attention over a contiguous KV history.
///
/// `k_cache`/`v_cache` are one layer's base slices of layout
/// `[max_seq_len, n_kv_heads, head_dim]`.
#[allow(clippy::too_many_arguments, clippy::cast_precision_loss)]
pub fn contiguous_attention(
    out: &mut [f32],
    q: &[f32],
    k_cache: &[f32],
    v_cache: &[f32],
    scores: &mut [f32],
    num_tokens: usize,
    head_dim: usize,
    n_heads: usize,
    n_kv_heads: usize,
) {
    let kv_mul = n_heads / n_kv_heads;
    let kv_dim = n_kv_heads * head_dim;
    let scale = 1.0 / (head_dim as f32).sqrt();

    out[..n_heads * head_dim].fill(0.0);

    for h in 0..n_heads {
        let q_head = &q[h * head_dim..(h + 1) * head_dim];
        let att = &mut scores[h * num_tokens..(h + 1) * num_tokens];
        let kv_h = h / kv_mul;

        for (t, att_t) in att.iter_mut().enumerate() {
            let offset = t * kv_dim + kv_h * head_dim;
            let k_head = &k_cache[offset..offset + head_dim];
            let mut score = 0.0f32;
            for i in 0..head_dim {
                score += q_head[i] * k_head[i];
            }
            *att_t = score * scale;
        }

        super::softmax(att);

        let out_head = &mut out[h * head_dim..(h + 1) * head_dim];
        for (t, &prob) in att.iter().enumerate() {
            let offset = t * kv_dim + kv_h * head_dim;
            let v_head = &v_cache[offset..offset + head_dim];
            for i in 0..head_dim {
                out_head[i] += prob * v_head[i];
            }
        }
    }
}

//! Scalar f32 kernels for the forward pass.
//!
//! All kernels operate on plain slices and accumulate in a fixed order so
//! that repeated runs are bit-identical. None of them parallelise
//! internally; one [`crate::StepEngine::step`] call is the atomic unit.

pub mod activation;
pub mod attention;
pub mod matmul;
pub mod norm;
pub mod rope;

pub use activation::{softmax, swiglu};
pub use attention::{contiguous_attention, paged_attention};
pub use matmul::matmul;
pub use norm::rms_norm;
pub use rope::apply_rope;

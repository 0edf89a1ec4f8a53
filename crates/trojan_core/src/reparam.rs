//! Bounded reparameterization for mask and pattern optimization.
//!
//! Gradient steps act on an unconstrained variable `x`; the value used in the
//! blend is `(tanh(x) + 1) / 2`, which saturates instead of leaving `[0, 1]`.

/// `(tanh(x) + 1) / 2`, always within `[0, 1]` for finite `x`.
pub fn tanh_unit(x: f32) -> f32 {
    ((x.tanh() + 1.0) * 0.5).clamp(0.0, 1.0)
}

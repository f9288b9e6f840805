/// Scalar type used throughout the crate.
pub type Float = f64;

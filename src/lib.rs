#![allow(non_snake_case)]

use types::Float;
pub extern crate nalgebra as na;

pub mod config;
pub mod contact;
pub mod controller;
pub mod error;
pub mod friction;
pub mod gait;
pub mod idyn;
pub mod ik;
pub mod jacobian;
pub mod lcp;
pub mod model;
pub mod pid;
pub mod qp;
pub mod stabilizer;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod helpers;

pub const GRAVITY: Float = 9.81;

pub const PI: Float = std::f64::consts::PI;

/// Spatial dimension of the floating base (linear + angular).
pub const NSPATIAL: usize = 6;
/// Euler-pose dimension of the floating base: translation + unit quaternion.
pub const NEULER: usize = 7;
/// Number of friction-pyramid directions per contact.
pub const NK: usize = 4;

/// sqrt(machine epsilon), the tolerance for "numerically zero".
pub const NEAR_ZERO: Float = 1.4901161193847656e-8;

#[macro_export]
macro_rules! assert_close {
    ($a:expr, $b:expr, $tol:expr) => {
        assert!(($a - $b).abs() < $tol, "{} != {} (tol {})", $a, $b, $tol);
    };
}

#[macro_export]
macro_rules! assert_vec_close {
    ($a:expr, $b:expr, $tol:expr) => {
        assert_eq!($a.len(), $b.len(), "length mismatch");
        for (x, y) in $a.iter().zip($b.iter()) {
            assert!((x - y).abs() < $tol, "{} != {} (tol {})", x, y, $tol);
        }
    };
}

//! Dense Lemke solver for linear complementarity problems.
//!
//! Find z >= 0 with w = M z + q >= 0 and z' w = 0. The pivoting is bounded
//! (10 n pivots) and the regularized wrapper retries with growing diagonal
//! perturbation up to 1e-4 before giving up, so a solve can fail but never
//! loop.

use na::{DMatrix, DVector};
use tracing::debug;

use crate::error::{ControlError, Result};
use crate::types::Float;

/// Pivot budget factor: at most 10 n pivots per attempt.
pub const LEMKE_PIVOT_FACTOR: usize = 10;
/// Largest diagonal perturbation tried by the regularized wrapper.
pub const LCP_REG_MAX: Float = 1e-4;
/// Feasibility slack accepted when validating a candidate solution.
pub const LCP_ZERO_TOL: Float = 1e-8;

const PIVOT_TOL: Float = 1e-12;

/// One Gauss-Jordan pivot of the tableau on (row, col).
fn pivot(T: &mut DMatrix<Float>, row: usize, col: usize) {
    let piv = T[(row, col)];
    let ncols = T.ncols();
    for j in 0..ncols {
        T[(row, j)] /= piv;
    }
    for i in 0..T.nrows() {
        if i == row {
            continue;
        }
        let factor = T[(i, col)];
        if factor == 0.0 {
            continue;
        }
        for j in 0..ncols {
            T[(i, j)] -= factor * T[(row, j)];
        }
    }
}

/// Complement of a variable index: w_i <-> z_i.
fn complement(var: usize, n: usize) -> usize {
    if var < n {
        var + n
    } else {
        var - n
    }
}

/// Lemke's algorithm with a covering ray. Variable indices: 0..n are w,
/// n..2n are z, 2n is the artificial z0.
pub fn lcp_lemke(M: &DMatrix<Float>, q: &DVector<Float>) -> Result<DVector<Float>> {
    let n = q.len();
    if n == 0 {
        return Ok(DVector::zeros(0));
    }
    if q.iter().all(|&x| x >= 0.0) {
        // trivially solved by z = 0
        return Ok(DVector::zeros(n));
    }

    let z0 = 2 * n;
    let rhs = 2 * n + 1;
    let mut T = DMatrix::zeros(n, 2 * n + 2);
    T.view_mut((0, 0), (n, n)).copy_from(&DMatrix::identity(n, n));
    T.view_mut((0, n), (n, n)).copy_from(&(-M));
    for i in 0..n {
        T[(i, z0)] = -1.0;
        T[(i, rhs)] = q[i];
    }

    let mut basis: Vec<usize> = (0..n).collect();

    // drive z0 in against the most negative rhs
    let mut row = 0;
    for i in 1..n {
        if T[(i, rhs)] < T[(row, rhs)] {
            row = i;
        }
    }
    pivot(&mut T, row, z0);
    let mut entering = complement(basis[row], n);
    basis[row] = z0;

    for _ in 0..LEMKE_PIVOT_FACTOR * n {
        // minimum-ratio test on the entering column, preferring the z0 row
        // on ties so the artificial variable exits as soon as it can
        let mut best: Option<usize> = None;
        let mut best_ratio = Float::INFINITY;
        for i in 0..n {
            let a = T[(i, entering)];
            if a > PIVOT_TOL {
                let ratio = T[(i, rhs)] / a;
                let better = match best {
                    None => true,
                    Some(b) => {
                        ratio < best_ratio - PIVOT_TOL
                            || (ratio < best_ratio + PIVOT_TOL && basis[i] == z0 && basis[b] != z0)
                    }
                };
                if better {
                    best = Some(i);
                    best_ratio = ratio;
                }
            }
        }
        let Some(row) = best else {
            // unbounded ray: no solution along this path
            return Err(ControlError::LcpUnsolvable);
        };

        pivot(&mut T, row, entering);
        let leaving = basis[row];
        basis[row] = entering;

        if leaving == z0 {
            let mut z = DVector::zeros(n);
            for (i, &var) in basis.iter().enumerate() {
                if var >= n && var < 2 * n {
                    z[var - n] = T[(i, rhs)].max(0.0);
                }
            }
            return Ok(z);
        }
        entering = complement(leaving, n);
    }

    Err(ControlError::LcpUnsolvable)
}

/// True when z solves LCP(M, q) within `LCP_ZERO_TOL` slack.
pub fn lcp_valid(M: &DMatrix<Float>, q: &DVector<Float>, z: &DVector<Float>) -> bool {
    if z.iter().any(|&x| x < -LCP_ZERO_TOL || !x.is_finite()) {
        return false;
    }
    let w = M * z + q;
    if w.iter().any(|&x| x < -LCP_ZERO_TOL * (1.0 + q.amax()) || !x.is_finite()) {
        return false;
    }
    let comp = z.dot(&w).abs();
    comp <= LCP_ZERO_TOL * (1.0 + q.amax()) * (z.len() as Float)
}

/// Lemke with diagonal regularization: retry with M + eps I for growing eps
/// until a validated solution appears or the 1e-4 cap is reached.
pub fn lcp_lemke_regularized(M: &DMatrix<Float>, q: &DVector<Float>) -> Result<DVector<Float>> {
    let n = q.len();
    if n == 0 {
        return Ok(DVector::zeros(0));
    }
    let mut eps = 0.0;
    loop {
        let Mr = if eps == 0.0 {
            M.clone()
        } else {
            M + DMatrix::identity(n, n) * eps
        };
        if let Ok(z) = lcp_lemke(&Mr, q) {
            if lcp_valid(&Mr, q, &z) {
                if eps > 0.0 {
                    debug!(eps, "LCP solved with regularization");
                }
                return Ok(z);
            }
        }
        if eps == 0.0 {
            eps = 1e-8;
        } else if eps < LCP_REG_MAX {
            eps *= 10.0;
        } else {
            return Err(ControlError::LcpUnsolvable);
        }
    }
}

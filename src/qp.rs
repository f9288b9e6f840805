//! Quadratic programs by reduction to LCPs.
//!
//! Two flavors cover everything the controller needs: a free-variable QP
//! (split x = x+ - x-) for the null-space polishing stages, and a
//! nonnegative QP with linear inequalities for the impulse fits. Both hand
//! a symmetric copositive LCP to the regularized Lemke solver.

use na::{DMatrix, DVector};

use crate::error::Result;
use crate::lcp::lcp_lemke_regularized;
use crate::types::Float;

/// minimize 1/2 x'Qx + c'x  subject to  A x >= b,  x free.
///
/// The LCP matrix is the standard split-variable block layout
///
/// ```text
///   |  Q -Q -A' |       |  c |
///   | -Q  Q  A' | , q = | -c |
///   |  A -A  0  |       | -b |
/// ```
pub fn solve_qp(
    Q: &DMatrix<Float>,
    c: &DVector<Float>,
    A: &DMatrix<Float>,
    b: &DVector<Float>,
) -> Result<DVector<Float>> {
    let n = Q.nrows();
    let m = A.nrows();

    let mut MMM = DMatrix::zeros(2 * n + m, 2 * n + m);
    MMM.view_mut((0, 0), (n, n)).copy_from(Q);
    MMM.view_mut((n, n), (n, n)).copy_from(Q);
    MMM.view_mut((0, n), (n, n)).copy_from(&(-Q));
    MMM.view_mut((n, 0), (n, n)).copy_from(&(-Q));

    if m > 0 {
        let At = A.transpose();
        MMM.view_mut((n, 2 * n), (n, m)).copy_from(&At);
        MMM.view_mut((0, 2 * n), (n, m)).copy_from(&(-&At));
        MMM.view_mut((2 * n, 0), (m, n)).copy_from(A);
        MMM.view_mut((2 * n, n), (m, n)).copy_from(&(-A));
    }

    let mut qqq = DVector::zeros(2 * n + m);
    qqq.rows_mut(0, n).copy_from(c);
    qqq.rows_mut(n, n).copy_from(&(-c));
    if m > 0 {
        qqq.rows_mut(2 * n, m).copy_from(&(-b));
    }

    let zzz = lcp_lemke_regularized(&MMM, &qqq)?;

    let mut x = DVector::zeros(n);
    for i in 0..n {
        x[i] = zzz[i] - zzz[n + i];
    }
    Ok(x)
}

/// minimize 1/2 z'Qz + c'z  subject to  z >= 0,  C z >= d.
///
/// KKT complementarity of the multiplier pair gives the LCP
///
/// ```text
///   | Q -C' |       |  c |
///   | C  0  | , q = | -d |
/// ```
pub fn solve_qp_nonneg(
    Q: &DMatrix<Float>,
    c: &DVector<Float>,
    C: &DMatrix<Float>,
    d: &DVector<Float>,
) -> Result<DVector<Float>> {
    let n = Q.nrows();
    let m = C.nrows();

    let mut M = DMatrix::zeros(n + m, n + m);
    M.view_mut((0, 0), (n, n)).copy_from(Q);
    if m > 0 {
        M.view_mut((0, n), (n, m)).copy_from(&(-C.transpose()));
        M.view_mut((n, 0), (m, n)).copy_from(C);
    }

    let mut q = DVector::zeros(n + m);
    q.rows_mut(0, n).copy_from(c);
    if m > 0 {
        q.rows_mut(n, m).copy_from(&(-d));
    }

    let z = lcp_lemke_regularized(&M, &q)?;
    Ok(DVector::from(z.rows(0, n)))
}

/// Orthonormal basis of the null space of a symmetric matrix via SVD.
/// Singular values at or below eps * rows * sigma_max count as zero; the
/// result is n x m with m possibly zero.
pub fn nullspace(Q: &DMatrix<Float>) -> DMatrix<Float> {
    let n = Q.ncols();
    let svd = Q.clone().svd(false, true);
    let Some(v_t) = svd.v_t else {
        return DMatrix::zeros(n, 0);
    };
    let sigma = &svd.singular_values;
    if sigma.len() == 0 {
        return DMatrix::zeros(n, 0);
    }
    let smax = sigma.amax();
    let zero_tol = Float::EPSILON * Q.nrows() as Float * smax;

    let null_rows: Vec<usize> = (0..sigma.len())
        .filter(|&i| sigma[i] <= zero_tol)
        .collect();
    let mut P = DMatrix::zeros(n, null_rows.len());
    for (col, &i) in null_rows.iter().enumerate() {
        P.set_column(col, &v_t.row(i).transpose());
    }
    P
}

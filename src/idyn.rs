//! Contact-constrained inverse dynamics.
//!
//! Over one tick the discretized Newton-Euler equation couples the joint
//! torques to admissible contact impulses:
//!
//! ```text
//!   M (v+ - v) = (tau + fext) dt + N cn + D beta
//! ```
//!
//! with tau zero on the 6 base rows, cn >= 0, beta >= 0 and the pyramid
//! Coulomb rows mu cn - e' beta >= 0 per contact. Stage I fits the impulses
//! to the unactuated base rows in least squares; Stage II polishes inside
//! the null space of the Stage-I Gram matrix without letting the residual
//! grow; the actuated rows then hand back the torques.

use std::time::Instant;

use na::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::error::{ControlError, Result};
use crate::pid::{check_finite, check_finite_mat};
use crate::qp::{nullspace, solve_qp, solve_qp_nonneg};
use crate::types::Float;
use crate::{NK, NSPATIAL};

#[derive(Debug, Clone)]
pub struct IdynSolution {
    /// Joint torques, NUM_JOINT_DOFS, not yet clamped.
    pub tau: DVector<Float>,
    /// Contact impulses [cn; beta], nc * (1 + NK).
    pub cf: DVector<Float>,
    pub stage1_residual: Float,
    pub stage2_residual: Float,
}

/// Solve for torques and contact impulses realizing `qdd_des` over `dt`.
///
/// `mu` carries one Coulomb coefficient per contact. `budget` is the wall
/// budget in seconds; exceeding it fails with `DeadlineExceeded` so the
/// tick can fall back to pure PID.
pub fn inverse_dynamics(
    v: &DVector<Float>,
    qdd_des: &DVector<Float>,
    M: &DMatrix<Float>,
    N: &DMatrix<Float>,
    D: &DMatrix<Float>,
    fext: &DVector<Float>,
    dt: Float,
    mu: &DVector<Float>,
    budget: Float,
) -> Result<IdynSolution> {
    let start = Instant::now();
    let ndof = v.len();
    let nj = ndof - NSPATIAL;
    let nc = N.ncols();

    check_finite(v, "idyn v")?;
    check_finite(qdd_des, "idyn qdd_des")?;
    check_finite(fext, "idyn fext")?;
    check_finite_mat(M, "idyn M")?;
    if M.clone().cholesky().is_none() {
        return Err(ControlError::SingularInertia);
    }

    // impulse needed beyond the external forces
    let dv = qdd_des * dt;
    let j_star = M * &dv - fext * dt;

    if nc == 0 {
        let tau = DVector::from(j_star.rows(0, nj)) / dt;
        check_finite(&tau, "idyn tau")?;
        return Ok(IdynSolution {
            tau,
            cf: DVector::zeros(0),
            stage1_residual: 0.0,
            stage2_residual: 0.0,
        });
    }

    let nvars = nc + nc * NK;
    let mut R = DMatrix::zeros(ndof, nvars);
    R.view_mut((0, 0), (ndof, nc)).copy_from(N);
    R.view_mut((0, nc), (ndof, nc * NK)).copy_from(D);

    // Stage I operates on the base rows only: torques span the actuated
    // rows, so only the unactuated residual constrains the impulses.
    let Rb = R.rows(nj, NSPATIAL).into_owned();
    let jb = DVector::from(j_star.rows(nj, NSPATIAL));

    let Q = Rb.transpose() * &Rb;
    let c = -(Rb.transpose() * &jb);

    // Coulomb rows: mu_i cn_i - sum_k beta_ik >= 0
    let mut C = DMatrix::zeros(nc, nvars);
    for i in 0..nc {
        C[(i, i)] = mu[i];
        for k in 0..NK {
            C[(i, nc + i * NK + k)] = -1.0;
        }
    }
    let d = DVector::zeros(nc);

    let mut z = solve_qp_nonneg(&Q, &c, &C, &d)?;
    let stage1_residual = (&Rb * &z - &jb).norm();
    if start.elapsed().as_secs_f64() > budget {
        return Err(ControlError::DeadlineExceeded);
    }

    // Stage II: polish inside null(Q) without losing Stage-I optimality.
    let mut stage2_residual = stage1_residual;
    let P = nullspace(&Q);
    let m = P.ncols();
    if m > 0 {
        let Q2 = P.transpose() * &P;
        let c2 = P.transpose() * &z;

        let mut A = DMatrix::zeros(1 + nvars, m);
        let mut b = DVector::zeros(1 + nvars);
        A.row_mut(0).copy_from(&(P.transpose() * &c).transpose());
        A.view_mut((1, 0), (nvars, m)).copy_from(&P);
        b.rows_mut(1, nvars).copy_from(&(-&z));

        match solve_qp(&Q2, &c2, &A, &b) {
            Ok(w) => {
                let candidate = &z + &P * w;
                let cand_residual = (&Rb * &candidate - &jb).norm();
                let nonneg = candidate.iter().all(|&x| x >= -crate::lcp::LCP_ZERO_TOL);
                if nonneg && cand_residual <= stage1_residual + crate::NEAR_ZERO {
                    z = candidate.map(|x| x.max(0.0));
                    stage2_residual = cand_residual;
                } else {
                    debug!("stage II candidate rejected, keeping stage I impulses");
                }
            }
            Err(e) => {
                warn!(error = %e, "stage II solve failed, keeping stage I impulses");
            }
        }
    }
    if start.elapsed().as_secs_f64() > budget {
        return Err(ControlError::DeadlineExceeded);
    }

    // actuated rows give the torques
    let residual_full = &j_star - &R * &z;
    let tau = DVector::from(residual_full.rows(0, nj)) / dt;
    check_finite(&tau, "idyn tau")?;
    check_finite(&z, "idyn impulses")?;

    Ok(IdynSolution {
        tau,
        cf: z,
        stage1_residual,
        stage2_residual,
    })
}

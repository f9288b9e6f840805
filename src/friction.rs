//! Per-contact Coulomb friction estimation.
//!
//! After the simulator has handled a contact step, the observed momentum
//! change minus the expected non-contact impulse leaves the impulse the
//! contacts must have applied. Fitting that residual to the contact span
//! [N S T] with nonnegative normals, then polishing in the null space of
//! the Gram matrix, yields per-contact normal and tangential impulses and
//! mu = |tangential| / normal.

use na::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::error::{ControlError, Result};
use crate::pid::check_finite;
use crate::qp::{nullspace, solve_qp};
use crate::types::Float;
use crate::NK;

#[derive(Debug, Clone)]
pub struct FrictionEstimate {
    /// One Coulomb coefficient per contact; NaN where the normal impulse
    /// vanished.
    pub mu: DVector<Float>,
    /// Fitted impulses [cn; beta_s; beta_t], 3 nc.
    pub cf: DVector<Float>,
    /// Norm of the unexplained impulse after the fit.
    pub residual: Float,
}

/// Holds the pre-contact velocity and external force between ticks.
#[derive(Debug, Default)]
pub struct FrictionEstimator {
    v_prev: Option<DVector<Float>>,
    f_prev: Option<DVector<Float>>,
}

impl FrictionEstimator {
    pub fn new() -> Self {
        FrictionEstimator::default()
    }

    /// Record the external force acting over the upcoming step.
    pub fn observe_forces(&mut self, fext: &DVector<Float>) {
        self.f_prev = Some(fext.clone());
    }

    /// Run the two-stage fit on a post-contact velocity. Returns `None`
    /// until both a pre-contact velocity and force have been seen, or when
    /// there are no contacts to attribute the impulse to.
    pub fn estimate(
        &mut self,
        v: &DVector<Float>,
        N: &DMatrix<Float>,
        D: &DMatrix<Float>,
        M: &DMatrix<Float>,
        dt: Float,
    ) -> Result<Option<FrictionEstimate>> {
        check_finite(v, "friction v")?;
        let nc = N.ncols();

        let (Some(v_prev), Some(f_prev)) = (self.v_prev.as_ref(), self.f_prev.as_ref()) else {
            self.v_prev = Some(v.clone());
            return Ok(None);
        };
        if nc == 0 {
            self.v_prev = Some(v.clone());
            return Ok(None);
        }

        let ngc = v.len();
        // observed minus expected impulse
        let dv = v - v_prev;
        let j_err = M * dv - f_prev * dt;

        // signed tangent span [S T], dropping the negated pyramid halves
        let mut ST = DMatrix::zeros(ngc, 2 * nc);
        for i in 0..nc {
            ST.set_column(i, &D.column(i * NK));
            ST.set_column(nc + i, &D.column(i * NK + 1));
        }
        let n = nc + 2 * nc;
        let mut R = DMatrix::zeros(ngc, n);
        R.view_mut((0, 0), (ngc, nc)).copy_from(N);
        R.view_mut((0, nc), (ngc, 2 * nc)).copy_from(&ST);

        // Stage I: least-squares fit with nonnegative normals
        let Q = R.transpose() * &R;
        let c = -(R.transpose() * &j_err);
        let mut A = DMatrix::zeros(nc, n);
        for i in 0..nc {
            A[(i, i)] = 1.0;
        }
        let b = DVector::zeros(nc);

        let mut z = solve_qp(&Q, &c, &A, &b).map_err(|_| ControlError::InfeasibleFriction)?;
        let mut residual = (&R * &z - &j_err).norm();
        debug!(residual, "friction estimation stage I");

        // Stage II: minimize |z| over null(Q) while the fit cannot degrade
        let P = nullspace(&Q);
        let m = P.ncols();
        if m > 0 {
            let Q2 = P.transpose() * &P;
            let c2 = P.transpose() * &z;

            let cN = DVector::from(z.rows(0, nc));
            let P_nc = P.rows(0, nc).into_owned();
            let mut A2 = DMatrix::zeros(nc + 1, m);
            let mut b2 = DVector::zeros(nc + 1);
            A2.row_mut(0).copy_from(&(P.transpose() * &c).transpose());
            A2.view_mut((1, 0), (nc, m)).copy_from(&P_nc);
            b2.rows_mut(1, nc).copy_from(&(-cN));

            match solve_qp(&Q2, &c2, &A2, &b2) {
                Ok(w) => {
                    z += &P * w;
                    residual = (&R * &z - &j_err).norm();
                    debug!(residual, "friction estimation stage II");
                }
                Err(e) => {
                    warn!(error = %e, "friction estimation stage II failed");
                }
            }
        }

        // mu per contact; NaN rows flag unloaded contacts
        let mut mu = DVector::zeros(nc);
        for i in 0..nc {
            let cn = z[i];
            let bs = z[nc + i];
            let bt = z[2 * nc + i];
            mu[i] = if cn > 0.0 {
                (bs * bs + bt * bt).sqrt() / cn
            } else {
                Float::NAN
            };
        }

        self.v_prev = Some(v.clone());
        Ok(Some(FrictionEstimate { mu, cf: z, residual }))
    }
}

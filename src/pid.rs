//! Joint-space feedback.
//!
//! A per-DOF PID on position/velocity error with integrator anti-windup and
//! per-joint torque clamping, plus the Cartesian alternative: end-effector
//! parallel stiffness mapped through the foot-chain Jacobians.

use na::{DMatrix, DVector, Vector3};

use crate::error::{ControlError, Result};
use crate::model::{KinematicModel, RobotModel};
use crate::types::Float;

/// PID gains of one generalized coordinate. `perr_sum` is the integrator
/// accumulator.
#[derive(Debug, Clone, Copy)]
pub struct Gains {
    pub kp: Float,
    pub kv: Float,
    pub ki: Float,
    pub perr_sum: Float,
}

impl Gains {
    pub fn new(kp: Float, kv: Float, ki: Float) -> Self {
        Gains {
            kp,
            kv,
            ki,
            perr_sum: 0.0,
        }
    }
}

pub struct JointPid {
    gains: Vec<Gains>,
    torque_limits: DVector<Float>,
    /// Reset the integrator when the position error changes sign.
    pub anti_windup: bool,
    prev_err: DVector<Float>,
}

impl JointPid {
    pub fn new(gains: Vec<Gains>, torque_limits: DVector<Float>) -> Self {
        let n = gains.len();
        JointPid {
            gains,
            torque_limits,
            anti_windup: true,
            prev_err: DVector::zeros(n),
        }
    }

    pub fn num_dofs(&self) -> usize {
        self.gains.len()
    }

    pub fn reset(&mut self) {
        for g in &mut self.gains {
            g.perr_sum = 0.0;
        }
        self.prev_err.fill(0.0);
    }

    /// Feedback torque ufb = kp e + kv edot + ki int(e), clamped per joint.
    pub fn control(
        &mut self,
        q_des: &DVector<Float>,
        qd_des: &DVector<Float>,
        q: &DVector<Float>,
        qd: &DVector<Float>,
        dt: Float,
    ) -> Result<DVector<Float>> {
        let n = self.gains.len();
        if q.len() != n || q_des.len() != n || qd.len() != n || qd_des.len() != n {
            return Err(ControlError::DofMismatch {
                id: "pid".to_string(),
                expected: n,
                got: q.len(),
            });
        }

        let mut ufb = DVector::zeros(n);
        for i in 0..n {
            let e = q_des[i] - q[i];
            let edot = qd_des[i] - qd[i];

            if self.anti_windup && e * self.prev_err[i] < 0.0 {
                self.gains[i].perr_sum = 0.0;
            }
            self.gains[i].perr_sum += e * dt;

            let g = &self.gains[i];
            let u = g.kp * e + g.kv * edot + g.ki * g.perr_sum;
            let lim = self.torque_limits[i];
            ufb[i] = u.clamp(-lim, lim);
            self.prev_err[i] = e;
        }
        Ok(ufb)
    }
}

/// Cartesian parallel stiffness: ufb = sum_f Jf' (kp (x_des - x) + kv (xd_des - xd))
/// over the foot chains, replacing the joint-space loop when enabled.
pub fn eef_stiffness_fb<E: KinematicModel>(
    model: &mut RobotModel<E>,
    feet: &[usize],
    x_des: &[Vector3<Float>],
    xd_des: &[Vector3<Float>],
    q_full: &DVector<Float>,
    v_full: &DVector<Float>,
    kp: Float,
    kv: Float,
) -> Result<DVector<Float>> {
    let nj = model.num_joint_dofs;
    model.set_state(q_full, v_full)?;
    let mut ufb = DVector::zeros(nj);

    for (k, &f) in feet.iter().enumerate() {
        let x = model.foot_position_bh(f, q_full)?;
        let J = model.foot_jacobian_bh(f, q_full)?;
        let chain = model.eefs[f].chain_coords.clone();
        let qd_chain = DVector::from_iterator(chain.len(), chain.iter().map(|&c| v_full[c]));
        let xd_vec = &J * qd_chain;
        let xd = Vector3::new(xd_vec[0], xd_vec[1], xd_vec[2]);

        let force = kp * (x_des[k] - x) + kv * (xd_des[k] - xd);
        let tau_chain = J.transpose() * DVector::from_column_slice(force.as_slice());
        for (j, &coord) in chain.iter().enumerate() {
            ufb[coord] += tau_chain[j];
        }
    }
    Ok(ufb)
}

/// Clamp a torque vector to the per-DOF limits.
pub fn clamp_torques(u: &mut DVector<Float>, limits: &DVector<Float>) {
    for i in 0..u.len() {
        u[i] = u[i].clamp(-limits[i], limits[i]);
    }
}

/// Fail with `NumericFailure` if any element is NaN or infinite.
pub fn check_finite(v: &DVector<Float>, what: &'static str) -> Result<()> {
    if v.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(ControlError::NumericFailure(what))
    }
}

/// Matrix flavor of [`check_finite`].
pub fn check_finite_mat(m: &DMatrix<Float>, what: &'static str) -> Result<()> {
    if m.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(ControlError::NumericFailure(what))
    }
}

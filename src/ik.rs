//! Resolved-motion-rate inverse kinematics.
//!
//! Each foot is solved independently over its own kinematic chain: iterate
//! q <- q + alpha * pinv(J) * (goal - fk(q)) with damped least squares until
//! the Cartesian residual is inside tolerance. Velocity and acceleration
//! goals propagate through the same Jacobian.

use itertools::izip;
use na::{DMatrix, DVector, Vector3};
use tracing::warn;

use crate::error::{ControlError, Result};
use crate::model::{KinematicModel, RobotModel};
use crate::types::Float;

pub const RMRC_MAX_ITER: usize = 100;
pub const RMRC_TOL: Float = 1e-4;
/// Damping added to J J' before inversion.
pub const RMRC_DAMPING: Float = 1e-6;

/// Damped least-squares step: pinv(J) * e.
fn damped_pinv_mul_dyn(J: &DMatrix<Float>, e: &DVector<Float>) -> Result<DVector<Float>> {
    let rows = J.nrows();
    let JJt = J * J.transpose() + DMatrix::identity(rows, rows) * RMRC_DAMPING;
    let chol = JJt
        .cholesky()
        .ok_or(ControlError::NumericFailure("damped IK system"))?;
    let y = chol.solve(e);
    Ok(J.transpose() * y)
}

fn damped_pinv_mul(J: &DMatrix<Float>, e: &Vector3<Float>) -> Result<DVector<Float>> {
    damped_pinv_mul_dyn(J, &DVector::from_column_slice(e.as_slice()))
}

/// Iterative IK for a 3D Cartesian goal in the body-horizontal frame.
/// Returns the full joint vector with the foot's chain coordinates solved.
pub fn rmrc<E: KinematicModel>(
    model: &mut RobotModel<E>,
    eef_idx: usize,
    q_full: &DVector<Float>,
    goal: &Vector3<Float>,
) -> Result<DVector<Float>> {
    let chain_coords = model.eefs[eef_idx].chain_coords.clone();
    let v_zero = DVector::zeros(model.ndofs);
    let mut q_work = q_full.clone();

    model.set_state(&q_work, &v_zero)?;
    let mut err = (goal - model.foot_position_bh(eef_idx, &q_work)?).norm();

    for _ in 0..RMRC_MAX_ITER {
        if err < RMRC_TOL {
            return Ok(q_work);
        }
        let fk = model.foot_position_bh(eef_idx, &q_work)?;
        let J = model.foot_jacobian_bh(eef_idx, &q_work)?;
        let dq = damped_pinv_mul(&J, &(goal - fk))?;

        // full step, backed off to a half step when the residual does not
        // decrease
        let mut alpha = 1.0;
        loop {
            let mut q_cand = q_work.clone();
            for (j, &coord) in chain_coords.iter().enumerate() {
                q_cand[coord] += alpha * dq[j];
            }
            model.set_state(&q_cand, &v_zero)?;
            let cand_err = (goal - model.foot_position_bh(eef_idx, &q_cand)?).norm();
            if cand_err < err || alpha < 1.0 {
                q_work = q_cand;
                err = cand_err;
                break;
            }
            alpha = 0.5;
        }
    }

    Err(ControlError::IkDivergence {
        eef: model.eefs[eef_idx].id.clone(),
        residual: err,
    })
}

/// Iterative IK for a 6D goal: position plus orientation, both in the
/// body-horizontal frame. The orientation error is the axis-angle of
/// goal_rot * fk_rot'.
pub fn rmrc_pose<E: KinematicModel>(
    model: &mut RobotModel<E>,
    eef_idx: usize,
    q_full: &DVector<Float>,
    goal_pos: &Vector3<Float>,
    goal_rot: &na::UnitQuaternion<Float>,
) -> Result<DVector<Float>> {
    let chain_coords = model.eefs[eef_idx].chain_coords.clone();
    let v_zero = DVector::zeros(model.ndofs);
    let mut q_work = q_full.clone();

    let pose_error = |model: &mut RobotModel<E>, q: &DVector<Float>| -> Result<DVector<Float>> {
        let (rot, pos) = model.foot_pose_bh(eef_idx, q)?;
        let rot_err = (goal_rot * rot.inverse()).scaled_axis();
        let mut e = DVector::zeros(6);
        for k in 0..3 {
            e[k] = goal_pos[k] - pos[k];
            e[3 + k] = rot_err[k];
        }
        Ok(e)
    };

    model.set_state(&q_work, &v_zero)?;
    let mut err = pose_error(model, &q_work)?.norm();

    for _ in 0..RMRC_MAX_ITER {
        if err < RMRC_TOL {
            return Ok(q_work);
        }
        let e = pose_error(model, &q_work)?;
        let J = model.foot_jacobian6_bh(eef_idx, &q_work)?;
        let dq = damped_pinv_mul_dyn(&J, &e)?;

        let mut alpha = 1.0;
        loop {
            let mut q_cand = q_work.clone();
            for (j, &coord) in chain_coords.iter().enumerate() {
                q_cand[coord] += alpha * dq[j];
            }
            model.set_state(&q_cand, &v_zero)?;
            let cand_err = pose_error(model, &q_cand)?.norm();
            if cand_err < err || alpha < 1.0 {
                q_work = q_cand;
                err = cand_err;
                break;
            }
            alpha = 0.5;
        }
    }

    Err(ControlError::IkDivergence {
        eef: model.eefs[eef_idx].id.clone(),
        residual: err,
    })
}

/// Joint position, velocity and acceleration references for a set of feet.
///
/// Feet whose IK diverges keep their previous joint goals (`prev_q_des`)
/// rather than failing the tick. Rates propagate as
/// qd = pinv(J) vel, qdd = pinv(J) (acc - Jdot qd) with Jdot taken as the
/// finite difference of the Jacobian across the commanded displacement.
pub fn end_effector_inverse_kinematics<E: KinematicModel>(
    model: &mut RobotModel<E>,
    feet: &[usize],
    pos_goals: &[Vector3<Float>],
    vel_goals: &[Vector3<Float>],
    acc_goals: &[Vector3<Float>],
    q_full: &DVector<Float>,
    prev_q_des: &DVector<Float>,
    dt: Float,
) -> Result<(DVector<Float>, DVector<Float>, DVector<Float>)> {
    let nj = model.num_joint_dofs;
    let v_zero = DVector::zeros(model.ndofs);
    let mut q_des = DVector::from(q_full.rows(0, nj));
    let mut qd_des = DVector::zeros(nj);
    let mut qdd_des = DVector::zeros(nj);

    for (&f, pos_goal, vel_goal, acc_goal) in izip!(feet, pos_goals, vel_goals, acc_goals) {
        // Jacobian at the measured pose, for the finite-difference Jdot
        model.set_state(q_full, &v_zero)?;
        let J_meas = model.foot_jacobian_bh(f, q_full)?;

        let chain_coords = model.eefs[f].chain_coords.clone();
        match rmrc(model, f, q_full, pos_goal) {
            Ok(q_solved) => {
                for &coord in &chain_coords {
                    q_des[coord] = q_solved[coord];
                }
            }
            Err(ControlError::IkDivergence { eef, residual }) => {
                warn!(%eef, residual, "IK diverged, keeping previous joint goals");
                for &coord in &chain_coords {
                    q_des[coord] = prev_q_des[coord];
                }
            }
            Err(e) => return Err(e),
        }

        // rates through the Jacobian at the solved pose
        let mut q_des_full = q_full.clone();
        q_des_full.rows_mut(0, nj).copy_from(&q_des);
        model.set_state(&q_des_full, &v_zero)?;
        let J_des = model.foot_jacobian_bh(f, &q_des_full)?;

        let qd_chain = damped_pinv_mul(&J_des, vel_goal)?;
        let Jdot = (&J_des - &J_meas) / dt;
        let drift = Vector3::from_iterator((&Jdot * &qd_chain).iter().copied());
        let qdd_chain = damped_pinv_mul(&J_des, &(acc_goal - drift))?;

        for (j, &coord) in chain_coords.iter().enumerate() {
            qd_des[coord] = qd_chain[j];
            qdd_des[coord] = qdd_chain[j];
        }
    }

    Ok((q_des, qd_des, qdd_des))
}

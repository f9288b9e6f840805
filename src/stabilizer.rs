//! Trunk stabilization feed-forward.
//!
//! A PD law on base roll, pitch and height produces a corrective base
//! wrench; the wrench is distributed over the contact span in least squares
//! and the joint-row reaction of that distribution is the feed-forward
//! torque. With no active contacts the stabilizer is silent.

use na::{DMatrix, DVector, Vector3};

use crate::error::{ControlError, Result};
use crate::types::Float;
use crate::NSPATIAL;

/// Gains of the trunk PD. Height is regulated toward `z_ref`.
#[derive(Debug, Clone, Copy)]
pub struct TrunkGains {
    pub kp_rp: Float,
    pub kv_rp: Float,
    pub kp_z: Float,
    pub kv_z: Float,
    pub z_ref: Float,
}

impl Default for TrunkGains {
    fn default() -> Self {
        TrunkGains {
            kp_rp: 5.0,
            kv_rp: 0.5,
            kp_z: 50.0,
            kv_z: 5.0,
            z_ref: 0.0,
        }
    }
}

/// Joint feed-forward opposing trunk roll/pitch/height error, realized
/// through the active-contact span R = [N D].
pub fn trunk_stabilizer(
    R: &DMatrix<Float>,
    roll_pitch_yaw: &Vector3<Float>,
    base_height: Float,
    base_twist: &DVector<Float>,
    gains: &TrunkGains,
) -> Result<DVector<Float>> {
    let ndof = R.nrows();
    let nj = ndof - NSPATIAL;
    if base_twist.len() != NSPATIAL {
        return Err(ControlError::DofMismatch {
            id: "base twist".to_string(),
            expected: NSPATIAL,
            got: base_twist.len(),
        });
    }
    if R.ncols() == 0 {
        return Ok(DVector::zeros(nj));
    }

    // corrective wrench: push height and level the trunk, leave yaw alone
    let mut w = DVector::zeros(NSPATIAL);
    w[2] = gains.kp_z * (gains.z_ref - base_height) - gains.kv_z * base_twist[2];
    w[3] = -gains.kp_rp * roll_pitch_yaw.x - gains.kv_rp * base_twist[3];
    w[4] = -gains.kp_rp * roll_pitch_yaw.y - gains.kv_rp * base_twist[4];

    // distribute the wrench over the contact span in least squares
    let Rb = R.rows(nj, NSPATIAL).into_owned();
    let gram = &Rb * Rb.transpose() + DMatrix::identity(NSPATIAL, NSPATIAL) * 1e-8;
    let chol = gram
        .cholesky()
        .ok_or(ControlError::NumericFailure("stabilizer gram"))?;
    let f = Rb.transpose() * chol.solve(&w);

    // the joint rows see the reaction of that distribution
    let Rj = R.rows(0, nj);
    Ok(-(Rj * f))
}

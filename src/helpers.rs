//! Test fixtures: an analytic planar-leg quadruped implementing
//! [`KinematicModel`], so the control stages can be exercised without a
//! rigid-body engine.
//!
//! The robot is a 2.6 kg body with four 2-DOF legs (hip pitch, knee pitch)
//! swinging in the sagittal plane. Forward kinematics, point Jacobians,
//! gravity forces and a point-mass inertia are all closed-form, which keeps
//! the fixtures exact enough for the algorithmic tests.

use std::collections::BTreeMap;

use na::{DMatrix, DVector, Matrix3, Quaternion, UnitQuaternion, Vector3};

use crate::error::{ControlError, Result};
use crate::model::{EefSpec, JointSpec, KinematicModel, RobotModel};
use crate::types::Float;
use crate::{GRAVITY, NEULER, NSPATIAL};

pub const BODY_MASS: Float = 2.0;
pub const FOOT_MASS: Float = 0.15;
/// Upper and lower leg segment lengths.
pub const L1: Float = 0.065;
pub const L2: Float = 0.065;
/// Home crouch: hip pitched forward, knee folded back symmetrically so the
/// foot stays below the hip.
pub const Q0_HIP: Float = 0.3;
pub const Q0_KNEE: Float = -0.6;

pub const FOOT_NAMES: [&str; 4] = ["LF_FOOT", "RF_FOOT", "LH_FOOT", "RH_FOOT"];

fn hip_offsets() -> [Vector3<Float>; 4] {
    [
        Vector3::new(0.11, 0.096278, 0.0),
        Vector3::new(0.11, -0.096278, 0.0),
        Vector3::new(-0.08, 0.096278, 0.0),
        Vector3::new(-0.08, -0.096278, 0.0),
    ]
}

fn skew(v: &Vector3<Float>) -> Matrix3<Float> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Analytic planar-leg quadruped engine.
pub struct PlanarQuadruped {
    q: DVector<Float>, // 8 joint dofs + 7 base pose
    v: DVector<Float>, // 8 joint dofs + 6 base twist
    poses: BTreeMap<String, (Matrix3<Float>, Vector3<Float>)>,
    poses_fresh: bool,
}

impl PlanarQuadruped {
    pub const NJ: usize = 8;

    pub fn new() -> Self {
        let mut q = DVector::zeros(Self::NJ + NEULER);
        q[Self::NJ + 6] = 1.0; // identity quaternion
        PlanarQuadruped {
            q,
            v: DVector::zeros(Self::NJ + NSPATIAL),
            poses: BTreeMap::new(),
            poses_fresh: false,
        }
    }

    fn base_rotation(&self) -> Matrix3<Float> {
        let nj = Self::NJ;
        let quat = Quaternion::new(self.q[nj + 6], self.q[nj + 3], self.q[nj + 4], self.q[nj + 5]);
        UnitQuaternion::from_quaternion(quat)
            .to_rotation_matrix()
            .into_inner()
    }

    fn base_translation(&self) -> Vector3<Float> {
        let nj = Self::NJ;
        Vector3::new(self.q[nj], self.q[nj + 1], self.q[nj + 2])
    }

    /// Foot position of leg `f` in the base frame.
    fn foot_in_base(&self, f: usize) -> Vector3<Float> {
        let t1 = self.q[2 * f];
        let t2 = self.q[2 * f + 1];
        let x = -(L1 * t1.sin() + L2 * (t1 + t2).sin());
        let z = -(L1 * t1.cos() + L2 * (t1 + t2).cos());
        hip_offsets()[f] + Vector3::new(x, 0.0, z)
    }

    /// Knee position of leg `f` in the base frame.
    fn knee_in_base(&self, f: usize) -> Vector3<Float> {
        let t1 = self.q[2 * f];
        hip_offsets()[f] + Vector3::new(-L1 * t1.sin(), 0.0, -L1 * t1.cos())
    }

    fn leg_of_link(link_id: &str) -> Option<usize> {
        FOOT_NAMES.iter().position(|n| *n == link_id)
    }

    pub fn generalized_velocity(&self) -> &DVector<Float> {
        &self.v
    }

    fn refresh_poses(&mut self) {
        let rot = self.base_rotation();
        let t = self.base_translation();
        self.poses.clear();
        self.poses.insert("BODY".to_string(), (rot, t));
        for (f, name) in FOOT_NAMES.iter().enumerate() {
            let p = t + rot * self.foot_in_base(f);
            self.poses.insert(name.to_string(), (rot, p));
        }
        self.poses_fresh = true;
    }
}

impl Default for PlanarQuadruped {
    fn default() -> Self {
        Self::new()
    }
}

impl KinematicModel for PlanarQuadruped {
    fn num_joint_dofs(&self) -> usize {
        Self::NJ
    }

    fn set_generalized_coordinates(&mut self, q: &DVector<Float>) -> Result<()> {
        if q.len() != Self::NJ + NEULER {
            return Err(ControlError::DofMismatch {
                id: "q".to_string(),
                expected: Self::NJ + NEULER,
                got: q.len(),
            });
        }
        self.q.copy_from(q);
        self.poses_fresh = false;
        Ok(())
    }

    fn set_generalized_velocity(&mut self, v: &DVector<Float>) -> Result<()> {
        if v.len() != Self::NJ + NSPATIAL {
            return Err(ControlError::DofMismatch {
                id: "v".to_string(),
                expected: Self::NJ + NSPATIAL,
                got: v.len(),
            });
        }
        self.v.copy_from(v);
        Ok(())
    }

    fn update_link_poses(&mut self) {
        self.refresh_poses();
    }

    fn update_link_velocities(&mut self) {
        // poses carry all the state this analytic model needs
    }

    fn generalized_inertia(&self) -> DMatrix<Float> {
        // point-mass inertia: M = sum_i m_i J_i' J_i over the link origins,
        // plus body rotational inertia and a small joint armature
        let ndof = Self::NJ + NSPATIAL;
        let mut M = DMatrix::zeros(ndof, ndof);

        let body_point = self.base_translation();
        let Jb = self
            .point_jacobian("BODY", &body_point)
            .unwrap_or_else(|_| DMatrix::zeros(6, ndof));
        let Jb_lin = Jb.rows(0, 3).into_owned();
        M += BODY_MASS * Jb_lin.transpose() * &Jb_lin;

        for name in FOOT_NAMES.iter() {
            if let Ok((_, p)) = self.link_pose(name) {
                if let Ok(J) = self.point_jacobian(name, &p) {
                    let J_lin = J.rows(0, 3).into_owned();
                    M += FOOT_MASS * J_lin.transpose() * &J_lin;
                }
            }
        }

        for i in 0..Self::NJ {
            M[(i, i)] += 1e-4; // armature
        }
        let inertia = [0.005, 0.008, 0.01];
        for (k, val) in inertia.into_iter().enumerate() {
            M[(Self::NJ + 3 + k, Self::NJ + 3 + k)] += val;
        }
        M
    }

    fn generalized_forces(&self) -> DVector<Float> {
        // gravity on each point mass, mapped through the same Jacobians as
        // the inertia so the two stay consistent
        let ndof = Self::NJ + NSPATIAL;
        let mut fext = DVector::zeros(ndof);

        let g_body = Vector3::new(0.0, 0.0, -BODY_MASS * GRAVITY);
        let body_point = self.base_translation();
        if let Ok(Jb) = self.point_jacobian("BODY", &body_point) {
            fext += Jb.rows(0, 3).transpose() * g_body;
        }
        let g_foot = Vector3::new(0.0, 0.0, -FOOT_MASS * GRAVITY);
        for name in FOOT_NAMES.iter() {
            if let Ok((_, p)) = self.link_pose(name) {
                if let Ok(J) = self.point_jacobian(name, &p) {
                    fext += J.rows(0, 3).transpose() * g_foot;
                }
            }
        }
        fext
    }

    fn link_ids(&self) -> Vec<String> {
        let mut ids = vec!["BODY".to_string()];
        ids.extend(FOOT_NAMES.iter().map(|s| s.to_string()));
        ids
    }

    fn link_mass(&self, id: &str) -> Result<Float> {
        match id {
            "BODY" => Ok(BODY_MASS),
            _ if Self::leg_of_link(id).is_some() => Ok(FOOT_MASS),
            _ => Err(ControlError::UnknownId(id.to_string())),
        }
    }

    fn link_pose(&self, id: &str) -> Result<(Matrix3<Float>, Vector3<Float>)> {
        if !self.poses_fresh {
            // poses are computed on demand from the stored coordinates
            let rot = self.base_rotation();
            let t = self.base_translation();
            if id == "BODY" {
                return Ok((rot, t));
            }
            if let Some(f) = Self::leg_of_link(id) {
                return Ok((rot, t + rot * self.foot_in_base(f)));
            }
            return Err(ControlError::UnknownId(id.to_string()));
        }
        self.poses
            .get(id)
            .copied()
            .ok_or_else(|| ControlError::UnknownId(id.to_string()))
    }

    fn point_jacobian(&self, link_id: &str, point_world: &Vector3<Float>) -> Result<DMatrix<Float>> {
        let ndof = Self::NJ + NSPATIAL;
        let rot = self.base_rotation();
        let base_t = self.base_translation();
        let mut J = DMatrix::zeros(6, ndof);

        // base columns: v_p = v_base + w x (p - x_base)
        let r = point_world - base_t;
        J.view_mut((0, Self::NJ), (3, 3))
            .copy_from(&Matrix3::identity());
        J.view_mut((0, Self::NJ + 3), (3, 3)).copy_from(&(-skew(&r)));
        J.view_mut((3, Self::NJ + 3), (3, 3))
            .copy_from(&Matrix3::identity());

        if link_id == "BODY" {
            return Ok(J);
        }
        let f = Self::leg_of_link(link_id)
            .ok_or_else(|| ControlError::UnknownId(link_id.to_string()))?;

        // chain columns: revolute about the world y-axis of the base
        let axis = rot * Vector3::y();
        let hip_origin = base_t + rot * hip_offsets()[f];
        let knee_origin = base_t + rot * self.knee_in_base(f);
        for (col, origin) in [(2 * f, hip_origin), (2 * f + 1, knee_origin)] {
            let lin = axis.cross(&(point_world - origin));
            for k in 0..3 {
                J[(k, col)] = lin[k];
                J[(3 + k, col)] = axis[k];
            }
        }
        Ok(J)
    }
}

/// Joint table of the planar quadruped: 2.6 N·m limits everywhere,
/// 6.0 N·m on the hind hip flexors.
pub fn test_joint_specs() -> Vec<JointSpec> {
    let mut specs = vec![];
    for leg in ["LF", "RF", "LH", "RH"] {
        let hip_limit = if matches!(leg, "LH" | "RH") { 6.0 } else { 2.6 };
        specs.push(JointSpec {
            id: format!("{leg}_HIP_FE"),
            dofs: 1,
            torque_limit: hip_limit,
            q0: vec![Q0_HIP],
        });
        specs.push(JointSpec {
            id: format!("{leg}_LEG_FE"),
            dofs: 1,
            torque_limit: 2.6,
            q0: vec![Q0_KNEE],
        });
    }
    specs
}

pub fn test_eef_specs() -> Vec<EefSpec> {
    let stand_z = -(L1 * Q0_HIP.cos() + L2 * (Q0_HIP + Q0_KNEE).cos());
    hip_offsets()
        .iter()
        .zip(FOOT_NAMES.iter())
        .zip(["LF", "RF", "LH", "RH"])
        .map(|((hip, foot), leg)| EefSpec {
            id: foot.to_string(),
            link_id: foot.to_string(),
            chain: vec![format!("{leg}_HIP_FE"), format!("{leg}_LEG_FE")],
            origin: Some(hip + Vector3::new(0.0, 0.0, stand_z)),
        })
        .collect()
}

/// The standard test robot.
pub fn build_test_quadruped() -> RobotModel<PlanarQuadruped> {
    RobotModel::new(PlanarQuadruped::new(), &test_joint_specs(), &test_eef_specs())
        .expect("test quadruped tables are consistent")
}

/// Full home coordinates: crouched legs, base level at standing height.
pub fn home_coordinates<E: KinematicModel>(model: &RobotModel<E>) -> DVector<Float> {
    let nj = model.num_joint_dofs;
    let mut q = DVector::zeros(nj + NEULER);
    q.rows_mut(0, nj).copy_from(&model.home_pose());
    let stand_z = L1 * Q0_HIP.cos() + L2 * (Q0_HIP + Q0_KNEE).cos();
    q[nj + 2] = stand_z;
    q[nj + 6] = 1.0;
    q
}

#[cfg(test)]
mod helpers_tests {
    use super::*;
    use crate::assert_close;

    #[test]
    fn home_feet_sit_on_the_ground() {
        let mut model = build_test_quadruped();
        let q = home_coordinates(&model);
        let v = DVector::zeros(model.ndofs);
        model.set_state(&q, &v).unwrap();

        for f in 0..4 {
            let p = model.foot_position_world(f).unwrap();
            assert_close!(p.z, 0.0, 1e-12);
        }
    }

    #[test]
    fn point_jacobian_matches_finite_difference() {
        let mut engine = PlanarQuadruped::new();
        let mut q = DVector::zeros(PlanarQuadruped::NJ + NEULER);
        q[0] = 0.3;
        q[1] = -0.6;
        q[PlanarQuadruped::NJ + 2] = 0.12;
        q[PlanarQuadruped::NJ + 6] = 1.0;
        engine.set_generalized_coordinates(&q).unwrap();
        engine.update_link_poses();

        let (_, p0) = engine.link_pose("LF_FOOT").unwrap();
        let J = engine.point_jacobian("LF_FOOT", &p0).unwrap();

        let h = 1e-7;
        for dof in 0..2 {
            let mut qp = q.clone();
            qp[dof] += h;
            let mut pert = PlanarQuadruped::new();
            pert.set_generalized_coordinates(&qp).unwrap();
            pert.update_link_poses();
            let (_, p1) = pert.link_pose("LF_FOOT").unwrap();
            let fd = (p1 - p0) / h;
            for k in 0..3 {
                assert_close!(J[(k, dof)], fd[k], 1e-5);
            }
        }
    }

    #[test]
    fn velocity_round_trips_through_the_engine() {
        let mut engine = PlanarQuadruped::new();
        let mut v = DVector::zeros(PlanarQuadruped::NJ + NSPATIAL);
        v[0] = 0.4;
        v[PlanarQuadruped::NJ] = -0.2;
        engine.set_generalized_velocity(&v).unwrap();
        assert_eq!(engine.generalized_velocity(), &v);
    }

    #[test]
    fn inertia_is_symmetric_positive_definite() {
        let mut engine = PlanarQuadruped::new();
        let q = home_coordinates(&build_test_quadruped());
        engine.set_generalized_coordinates(&q).unwrap();
        engine.update_link_poses();

        let M = engine.generalized_inertia();

        assert_eq!(M.nrows(), 14);
        let sym_err = (&M - M.transpose()).norm();
        assert_close!(sym_err, 0.0, 1e-10);
        assert!(M.clone().cholesky().is_some(), "M must be SPD");
    }

    #[test]
    fn gravity_forces_sum_to_total_weight_on_the_base() {
        let mut engine = PlanarQuadruped::new();
        let q = home_coordinates(&build_test_quadruped());
        engine.set_generalized_coordinates(&q).unwrap();
        engine.update_link_poses();

        let fext = engine.generalized_forces();

        // base z row carries the whole weight
        assert_close!(
            fext[PlanarQuadruped::NJ + 2],
            -(BODY_MASS + 4.0 * FOOT_MASS) * GRAVITY,
            1e-9
        );
    }
}

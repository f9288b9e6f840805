//! Robot structure tables and the adapter onto the external dynamics engine.
//!
//! The engine owns the kinematic state (joint angles, link poses). Before
//! any kinematic or Jacobian query the core pushes the current coordinates
//! into the engine and refreshes link poses; callers must not interleave
//! that transaction across ticks, so all engine access is serialized through
//! the worker that runs the tick.

use na::{DMatrix, DVector, Matrix3, Quaternion, UnitQuaternion, Vector3};

use crate::error::{ControlError, Result};
use crate::types::Float;
use crate::{GRAVITY, NEULER, NSPATIAL};

/// Interface consumed from the rigid-body dynamics engine.
///
/// Point Jacobians are 6 x NDOF with the linear rows first, and generalized
/// vectors are laid out joints-first with the 6 base rows last.
pub trait KinematicModel {
    fn num_joint_dofs(&self) -> usize;

    /// Full coordinates: joint DOFs then the 7-component base pose
    /// [x y z, qx qy qz qw].
    fn set_generalized_coordinates(&mut self, q: &DVector<Float>) -> Result<()>;

    /// Full velocity: joint DOFs then the 6-component base twist.
    fn set_generalized_velocity(&mut self, v: &DVector<Float>) -> Result<()>;

    fn update_link_poses(&mut self);
    fn update_link_velocities(&mut self);

    /// NDOF x NDOF symmetric positive definite inertia.
    fn generalized_inertia(&self) -> DMatrix<Float>;

    /// Generalized external forces (gravity, Coriolis, applied), NDOF.
    fn generalized_forces(&self) -> DVector<Float>;

    fn link_ids(&self) -> Vec<String>;
    fn link_mass(&self, id: &str) -> Result<Float>;
    fn link_pose(&self, id: &str) -> Result<(Matrix3<Float>, Vector3<Float>)>;

    /// Jacobian of a world point rigidly attached to `link_id`:
    /// 6 x NDOF, rows 0..3 linear, rows 3..6 angular.
    fn point_jacobian(&self, link_id: &str, point_world: &Vector3<Float>)
        -> Result<DMatrix<Float>>;
}

/// A joint of the model: its slice of the generalized coordinates plus the
/// per-joint actuation data.
#[derive(Debug, Clone)]
pub struct Joint {
    pub id: String,
    /// Generalized-coordinate indices, in order.
    pub coords: Vec<usize>,
    pub torque_limit: Float,
    /// Nominal home angles, one per DOF.
    pub q0: DVector<Float>,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub id: String,
    pub mass: Float,
}

/// An end effector (foot) and its kinematic chain.
///
/// `active` reports sensed contact; `stance` is what the gait commands.
/// They are distinct on purpose: during walking the planner also marks
/// planner-stance feet active for Jacobian assembly, while the friction
/// estimator and the contact set always follow sensed contacts.
#[derive(Debug, Clone)]
pub struct EndEffector {
    pub id: String,
    /// Index of the foot link in the link table.
    pub link: usize,
    /// Joint indices from root to foot.
    pub chain: Vec<usize>,
    /// Generalized coordinates covered by the chain, in chain order.
    pub chain_coords: Vec<usize>,
    /// Nominal foot origin in the body-horizontal frame.
    pub origin: Vector3<Float>,
    pub active: bool,
    pub stance: bool,
}

/// Specification of one joint, in generalized-coordinate order.
#[derive(Debug, Clone)]
pub struct JointSpec {
    pub id: String,
    pub dofs: usize,
    pub torque_limit: Float,
    pub q0: Vec<Float>,
}

/// Specification of one end effector.
#[derive(Debug, Clone)]
pub struct EefSpec {
    pub id: String,
    pub link_id: String,
    pub chain: Vec<String>,
    pub origin: Option<Vector3<Float>>,
}

/// The robot model: structure tables plus the engine adapter. Cyclic
/// relationships (foot -> chain -> joints) are indices into the arena
/// tables, never owning pointers.
pub struct RobotModel<E: KinematicModel> {
    pub engine: E,
    pub joints: Vec<Joint>,
    pub links: Vec<Link>,
    pub eefs: Vec<EndEffector>,
    pub num_joint_dofs: usize,
    /// Joint DOFs plus the 6 base rows.
    pub ndofs: usize,
}

impl<E: KinematicModel> RobotModel<E> {
    pub fn new(engine: E, joint_specs: &[JointSpec], eef_specs: &[EefSpec]) -> Result<Self> {
        let mut joints = Vec::with_capacity(joint_specs.len());
        let mut coord = 0;
        for spec in joint_specs {
            if spec.q0.len() != spec.dofs {
                return Err(ControlError::DofMismatch {
                    id: spec.id.clone(),
                    expected: spec.dofs,
                    got: spec.q0.len(),
                });
            }
            joints.push(Joint {
                id: spec.id.clone(),
                coords: (coord..coord + spec.dofs).collect(),
                torque_limit: spec.torque_limit,
                q0: DVector::from_vec(spec.q0.clone()),
            });
            coord += spec.dofs;
        }
        let num_joint_dofs = coord;
        if num_joint_dofs != engine.num_joint_dofs() {
            return Err(ControlError::DofMismatch {
                id: "joint table".to_string(),
                expected: engine.num_joint_dofs(),
                got: num_joint_dofs,
            });
        }

        let links: Vec<Link> = engine
            .link_ids()
            .into_iter()
            .map(|id| {
                let mass = engine.link_mass(&id)?;
                Ok(Link { id, mass })
            })
            .collect::<Result<_>>()?;

        let mut eefs = Vec::with_capacity(eef_specs.len());
        for spec in eef_specs {
            let link = links
                .iter()
                .position(|l| l.id == spec.link_id)
                .ok_or_else(|| ControlError::UnknownId(spec.link_id.clone()))?;
            let mut chain = Vec::with_capacity(spec.chain.len());
            let mut chain_coords = vec![];
            for joint_id in &spec.chain {
                let idx = joints
                    .iter()
                    .position(|j| &j.id == joint_id)
                    .ok_or_else(|| ControlError::UnknownId(joint_id.clone()))?;
                chain.push(idx);
                chain_coords.extend(joints[idx].coords.iter().copied());
            }
            eefs.push(EndEffector {
                id: spec.id.clone(),
                link,
                chain,
                chain_coords,
                origin: spec.origin.unwrap_or_else(Vector3::zeros),
                active: false,
                stance: false,
            });
        }

        Ok(RobotModel {
            engine,
            joints,
            links,
            eefs,
            num_joint_dofs,
            ndofs: num_joint_dofs + NSPATIAL,
        })
    }

    pub fn joint_index(&self, id: &str) -> Result<usize> {
        self.joints
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| ControlError::UnknownId(id.to_string()))
    }

    pub fn eef_index(&self, id: &str) -> Result<usize> {
        self.eefs
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| ControlError::UnknownId(id.to_string()))
    }

    /// Home configuration assembled from the per-joint q0 entries.
    pub fn home_pose(&self) -> DVector<Float> {
        let mut q = DVector::zeros(self.num_joint_dofs);
        for joint in &self.joints {
            for (j, &coord) in joint.coords.iter().enumerate() {
                q[coord] = joint.q0[j];
            }
        }
        q
    }

    /// Per-DOF torque limits, NUM_JOINT_DOFS.
    pub fn torque_limits(&self) -> DVector<Float> {
        let mut lim = DVector::zeros(self.num_joint_dofs);
        for joint in &self.joints {
            for &coord in &joint.coords {
                lim[coord] = joint.torque_limit;
            }
        }
        lim
    }

    /// Push coordinates and velocities into the engine and refresh link
    /// poses/velocities. This is the engine transaction every kinematic
    /// query depends on.
    pub fn set_state(&mut self, q_full: &DVector<Float>, v_full: &DVector<Float>) -> Result<()> {
        if q_full.len() != self.num_joint_dofs + NEULER {
            return Err(ControlError::DofMismatch {
                id: "q".to_string(),
                expected: self.num_joint_dofs + NEULER,
                got: q_full.len(),
            });
        }
        if v_full.len() != self.ndofs {
            return Err(ControlError::DofMismatch {
                id: "v".to_string(),
                expected: self.ndofs,
                got: v_full.len(),
            });
        }
        self.engine.set_generalized_coordinates(q_full)?;
        self.engine.set_generalized_velocity(v_full)?;
        self.engine.update_link_poses();
        self.engine.update_link_velocities();
        Ok(())
    }

    /// Base pose from a full coordinate vector: (rotation, translation).
    pub fn base_pose(&self, q_full: &DVector<Float>) -> (UnitQuaternion<Float>, Vector3<Float>) {
        let nj = self.num_joint_dofs;
        let t = Vector3::new(q_full[nj], q_full[nj + 1], q_full[nj + 2]);
        let quat = Quaternion::new(
            q_full[nj + 6],
            q_full[nj + 3],
            q_full[nj + 4],
            q_full[nj + 5],
        );
        (UnitQuaternion::from_quaternion(quat), t)
    }

    /// Frame aligned with gravity but sharing the base yaw: the rotation
    /// keeps yaw only, the translation is the base position.
    pub fn base_horizontal_frame(
        &self,
        q_full: &DVector<Float>,
    ) -> (UnitQuaternion<Float>, Vector3<Float>) {
        let (rot, t) = self.base_pose(q_full);
        let (_roll, _pitch, yaw) = rot.euler_angles();
        (UnitQuaternion::from_euler_angles(0.0, 0.0, yaw), t)
    }

    pub fn roll_pitch_yaw(&self, q_full: &DVector<Float>) -> Vector3<Float> {
        let (rot, _) = self.base_pose(q_full);
        let (roll, pitch, yaw) = rot.euler_angles();
        Vector3::new(roll, pitch, yaw)
    }

    /// World position of a foot, from the engine's current link poses.
    pub fn foot_position_world(&self, eef_idx: usize) -> Result<Vector3<Float>> {
        let link = &self.links[self.eefs[eef_idx].link];
        let (_rot, t) = self.engine.link_pose(&link.id)?;
        Ok(t)
    }

    /// Foot position in the body-horizontal frame of `q_full`.
    pub fn foot_position_bh(&self, eef_idx: usize, q_full: &DVector<Float>) -> Result<Vector3<Float>> {
        let (bh_rot, bh_t) = self.base_horizontal_frame(q_full);
        let p = self.foot_position_world(eef_idx)?;
        Ok(bh_rot.inverse() * (p - bh_t))
    }

    /// Full foot pose in the body-horizontal frame: (orientation, position).
    pub fn foot_pose_bh(
        &self,
        eef_idx: usize,
        q_full: &DVector<Float>,
    ) -> Result<(UnitQuaternion<Float>, Vector3<Float>)> {
        let (bh_rot, bh_t) = self.base_horizontal_frame(q_full);
        let link = &self.links[self.eefs[eef_idx].link];
        let (rot, t) = self.engine.link_pose(&link.id)?;
        let rot_bh = bh_rot.inverse()
            * UnitQuaternion::from_rotation_matrix(&na::Rotation3::from_matrix_unchecked(rot));
        Ok((rot_bh, bh_rot.inverse() * (t - bh_t)))
    }

    /// Linear Jacobian of the foot point restricted to the foot's chain
    /// coordinates, expressed in the body-horizontal frame: 3 x chain_len.
    pub fn foot_jacobian_bh(
        &self,
        eef_idx: usize,
        q_full: &DVector<Float>,
    ) -> Result<DMatrix<Float>> {
        let eef = &self.eefs[eef_idx];
        let p = self.foot_position_world(eef_idx)?;
        let J = self
            .engine
            .point_jacobian(&self.links[eef.link].id, &p)?;
        let (bh_rot, _) = self.base_horizontal_frame(q_full);
        let R_inv = bh_rot.inverse().to_rotation_matrix();

        let mut Jf = DMatrix::zeros(3, eef.chain_coords.len());
        for (col, &coord) in eef.chain_coords.iter().enumerate() {
            let j_col = Vector3::new(J[(0, coord)], J[(1, coord)], J[(2, coord)]);
            Jf.set_column(col, &(R_inv * j_col));
        }
        Ok(Jf)
    }

    /// Spatial (linear + angular) foot Jacobian restricted to the chain,
    /// expressed in the body-horizontal frame: 6 x chain_len.
    pub fn foot_jacobian6_bh(
        &self,
        eef_idx: usize,
        q_full: &DVector<Float>,
    ) -> Result<DMatrix<Float>> {
        let eef = &self.eefs[eef_idx];
        let p = self.foot_position_world(eef_idx)?;
        let J = self
            .engine
            .point_jacobian(&self.links[eef.link].id, &p)?;
        let (bh_rot, _) = self.base_horizontal_frame(q_full);
        let R_inv = bh_rot.inverse().to_rotation_matrix();

        let mut Jf = DMatrix::zeros(6, eef.chain_coords.len());
        for (col, &coord) in eef.chain_coords.iter().enumerate() {
            let lin = Vector3::new(J[(0, coord)], J[(1, coord)], J[(2, coord)]);
            let ang = Vector3::new(J[(3, coord)], J[(4, coord)], J[(5, coord)]);
            let lin = R_inv * lin;
            let ang = R_inv * ang;
            for k in 0..3 {
                Jf[(k, col)] = lin[k];
                Jf[(3 + k, col)] = ang[k];
            }
        }
        Ok(Jf)
    }

    /// Center of mass of the robot from the engine's link poses, with the
    /// total mass.
    pub fn calc_com(&self) -> Result<(Vector3<Float>, Float)> {
        let mut com = Vector3::zeros();
        let mut total = 0.0;
        for link in &self.links {
            let (_rot, t) = self.engine.link_pose(&link.id)?;
            com += link.mass * t;
            total += link.mass;
        }
        if total <= 0.0 {
            return Err(ControlError::Config("robot has no mass".to_string()));
        }
        Ok((com / total, total))
    }

    /// Zero-moment point on the ground plane from CoM state:
    /// x_zmp = x - z / (zdd + g) * xdd, per horizontal axis.
    pub fn calc_zmp(com: &Vector3<Float>, com_acc: &Vector3<Float>) -> Vector3<Float> {
        let denom = com_acc.z + GRAVITY;
        if denom.abs() < crate::NEAR_ZERO {
            return Vector3::new(com.x, com.y, 0.0);
        }
        Vector3::new(
            com.x - com.z / denom * com_acc.x,
            com.y - com.z / denom * com_acc.y,
            0.0,
        )
    }

    /// Mechanical energy: kinetic from the generalized inertia plus link
    /// potential energy through the engine poses.
    pub fn calc_energy(&self, v: &DVector<Float>, M: &DMatrix<Float>) -> Result<Float> {
        let ke = 0.5 * (v.transpose() * M * v)[(0, 0)];
        let mut pe = 0.0;
        for link in &self.links {
            let (_rot, t) = self.engine.link_pose(&link.id)?;
            pe += link.mass * GRAVITY * t.z;
        }
        Ok(ke + pe)
    }

    /// Sensed contact handling: mark feet active whose link carries at
    /// least one contact. Returns the number of active feet.
    pub fn activate_from_contacts(&mut self, contacts: &[crate::contact::Contact]) -> usize {
        let mut nc = 0;
        for i in 0..self.eefs.len() {
            let link_id = &self.links[self.eefs[i].link].id;
            self.eefs[i].active = contacts.iter().any(|c| &c.id == link_id);
            if self.eefs[i].active {
                nc += 1;
            }
        }
        nc
    }
}

#[cfg(test)]
mod model_tests {
    use super::*;
    use crate::assert_close;
    use crate::helpers::build_test_quadruped;

    #[test]
    fn base_horizontal_frame_keeps_yaw_only() {
        let model = build_test_quadruped();
        let nj = model.num_joint_dofs;

        let mut q = DVector::zeros(nj + NEULER);
        // roll 0.2, pitch -0.1, yaw 0.7
        let rot = UnitQuaternion::from_euler_angles(0.2, -0.1, 0.7);
        q[nj] = 1.0;
        q[nj + 2] = 0.13;
        q[nj + 3] = rot.coords.x;
        q[nj + 4] = rot.coords.y;
        q[nj + 5] = rot.coords.z;
        q[nj + 6] = rot.coords.w;

        let (bh, t) = model.base_horizontal_frame(&q);
        let (roll, pitch, yaw) = bh.euler_angles();

        assert_close!(roll, 0.0, 1e-12);
        assert_close!(pitch, 0.0, 1e-12);
        assert_close!(yaw, 0.7, 1e-9);
        assert_close!(t.x, 1.0, 1e-12);
        assert_close!(t.z, 0.13, 1e-12);
    }

    #[test]
    fn com_of_home_pose_is_near_body_center() {
        let mut model = build_test_quadruped();
        let q = crate::helpers::home_coordinates(&model);
        let v = DVector::zeros(model.ndofs);
        model.set_state(&q, &v).unwrap();

        let (com, mass) = model.calc_com().unwrap();

        assert_close!(mass, 2.6, 1e-9);
        // legs are symmetric about y
        assert_close!(com.y, 0.0, 1e-9);
        assert!(com.z < 0.13 && com.z > -0.13);
    }

    #[test]
    fn zmp_of_static_com_is_under_com() {
        let com = Vector3::new(0.02, -0.01, 0.13);
        let zmp = RobotModel::<crate::helpers::PlanarQuadruped>::calc_zmp(&com, &Vector3::zeros());
        assert_close!(zmp.x, 0.02, 1e-12);
        assert_close!(zmp.y, -0.01, 1e-12);
        assert_close!(zmp.z, 0.0, 1e-12);
    }

    #[test]
    fn mechanical_energy_tracks_base_speed() {
        let mut model = build_test_quadruped();
        let q = crate::helpers::home_coordinates(&model);
        let v = DVector::zeros(model.ndofs);
        model.set_state(&q, &v).unwrap();
        let M = model.engine.generalized_inertia();
        let e0 = model.calc_energy(&v, &M).unwrap();

        // 1 m/s along x adds exactly half m v^2 for the point-mass model
        let mut v1 = v.clone();
        v1[model.num_joint_dofs] = 1.0;
        let e1 = model.calc_energy(&v1, &M).unwrap();

        assert_close!(e1 - e0, 0.5 * 2.6, 1e-9);
    }

    #[test]
    fn activation_follows_sensed_contacts() {
        let mut model = build_test_quadruped();
        let contacts = vec![crate::contact::Contact::new(
            "LF_FOOT",
            na::vector![0.11, 0.096278, 0.0],
            na::vector![0.0, 0.0, 1.0],
        )];

        let nc = model.activate_from_contacts(&contacts);

        assert_eq!(nc, 1);
        assert!(model.eefs[model.eef_index("LF_FOOT").unwrap()].active);
        assert!(!model.eefs[model.eef_index("RF_FOOT").unwrap()].active);
    }
}

//! The whole-body control tick.
//!
//! One `Controller` value owns the state store, the robot model and the
//! pluggable stages, and runs the phase-ordered pipeline each tick:
//!
//! PERCEPTION ingest sensors, assemble M / fext / contact Jacobians, CoM
//! and ZMP; PLANNING gait references through RMRC into joint goals (plus
//! trunk stabilization feed-forward); CONTROL PID feedback plus
//! contact-constrained inverse dynamics feed-forward, combined, clamped and
//! written as the torque command; WAITING cleanup.
//!
//! Recovery is local and conservative: IK divergence keeps the previous
//! goals, an LCP failure or deadline overrun falls back to pure PID, and
//! any non-finite output latches a fault and commands zero torque.

use na::{DMatrix, DVector, Vector3, Vector6};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::contact::Contact;
use crate::error::{ControlError, Result};
use crate::friction::FrictionEstimator;
use crate::gait::{FootPlan, FootPlanner};
use crate::idyn::inverse_dynamics;
use crate::ik::end_effector_inverse_kinematics;
use crate::jacobian::{calc_contact_jacobians, ContactJacobians};
use crate::model::{KinematicModel, RobotModel};
use crate::pid::{check_finite, check_finite_mat, clamp_torques, eef_stiffness_fb, Gains, JointPid};
use crate::stabilizer::{trunk_stabilizer, TrunkGains};
use crate::state::{RobotStateStore, Unit, Value};
use crate::types::Float;
use crate::{NEULER, NSPATIAL};

/// Sensor snapshot delivered by the host at the top of each tick.
#[derive(Debug, Clone)]
pub struct SensorData {
    pub q: DVector<Float>,
    pub qd: DVector<Float>,
    /// [x y z, qx qy qz qw]
    pub base_pose: DVector<Float>,
    /// [vx vy vz, wx wy wz]
    pub base_twist: DVector<Float>,
    pub contacts: Vec<Contact>,
}

/// Per-tick scratch shared by the stages. Built during PERCEPTION; each
/// stage copies what it needs at entry, so mid-tick writes by other threads
/// to unrelated store keys cannot tear a stage.
pub struct TickContext {
    pub t: Float,
    pub dt: Float,
    pub q_full: DVector<Float>,
    pub v_full: DVector<Float>,
    pub qdd: DVector<Float>,
    pub M: DMatrix<Float>,
    pub fext: DVector<Float>,
    pub jac: ContactJacobians,
    pub contacts: Vec<Contact>,
    pub mu: DVector<Float>,
    pub foot_plans: Vec<FootPlan>,
    pub q_des: DVector<Float>,
    pub qd_des: DVector<Float>,
    pub qdd_des: DVector<Float>,
    pub ufb: DVector<Float>,
    pub uff: DVector<Float>,
}

/// Capability contract of a pluggable stage: snapshot, compute, publish.
/// Swapping a stage is swapping this implementation, not subclassing the
/// controller.
pub trait Stage<E: KinematicModel> {
    type Scratch;
    type Output;

    fn prepare(&mut self, model: &mut RobotModel<E>, ctx: &TickContext) -> Result<Self::Scratch>;
    fn run(&mut self, model: &mut RobotModel<E>, scratch: Self::Scratch) -> Result<Self::Output>;
    fn commit(
        &mut self,
        model: &mut RobotModel<E>,
        store: &RobotStateStore,
        ctx: &mut TickContext,
        out: Self::Output,
    ) -> Result<()>;
}

/// PLANNING: gait references through RMRC into joint goals.
pub struct PlanningStage {
    pub walk: bool,
    pub trunk_stabilization: bool,
    pub planner: FootPlanner,
    pub body_twist: Vector6<Float>,
    pub trunk_gains: TrunkGains,
    prev_q_des: DVector<Float>,
}

pub struct PlanningScratch {
    q_full: DVector<Float>,
    qd: DVector<Float>,
    qdd: DVector<Float>,
    dt: Float,
    plans: Vec<FootPlan>,
}

pub struct PlanningOutput {
    q_des: DVector<Float>,
    qd_des: DVector<Float>,
    qdd_des: DVector<Float>,
    plans: Vec<FootPlan>,
    stabilization: Option<DVector<Float>>,
}

impl<E: KinematicModel> Stage<E> for PlanningStage {
    type Scratch = PlanningScratch;
    type Output = PlanningOutput;

    fn prepare(&mut self, model: &mut RobotModel<E>, ctx: &TickContext) -> Result<PlanningScratch> {
        let nj = model.num_joint_dofs;
        let plans = if self.walk {
            let origins: Vec<Vector3<Float>> = model.eefs.iter().map(|e| e.origin).collect();
            self.planner.plan_all(ctx.t, &self.body_twist, &origins)
        } else {
            vec![]
        };
        Ok(PlanningScratch {
            q_full: ctx.q_full.clone(),
            qd: DVector::from(ctx.v_full.rows(0, nj)),
            qdd: ctx.qdd.clone(),
            dt: ctx.dt,
            plans,
        })
    }

    fn run(&mut self, model: &mut RobotModel<E>, scratch: PlanningScratch) -> Result<PlanningOutput> {
        let nj = model.num_joint_dofs;
        // defaults: hold the measured state
        let mut q_des = DVector::from(scratch.q_full.rows(0, nj));
        let mut qd_des = scratch.qd.clone();
        let mut qdd_des = scratch.qdd.clone();

        if self.walk {
            let feet: Vec<usize> = (0..model.eefs.len()).collect();
            let pos: Vec<Vector3<Float>> = scratch.plans.iter().map(|p| p.pos).collect();
            let vel: Vec<Vector3<Float>> = scratch.plans.iter().map(|p| p.vel).collect();
            let acc: Vec<Vector3<Float>> = scratch.plans.iter().map(|p| p.acc).collect();

            let (q_ik, qd_ik, qdd_ik) = end_effector_inverse_kinematics(
                model,
                &feet,
                &pos,
                &vel,
                &acc,
                &scratch.q_full,
                &self.prev_q_des,
                scratch.dt,
            )?;
            q_des = q_ik;
            // IK rates replace the measured defaults on every chain
            qd_des = qd_ik;
            qdd_des = qdd_ik;
        }

        Ok(PlanningOutput {
            q_des,
            qd_des,
            qdd_des,
            plans: scratch.plans,
            stabilization: None,
        })
    }

    fn commit(
        &mut self,
        model: &mut RobotModel<E>,
        store: &RobotStateStore,
        ctx: &mut TickContext,
        mut out: PlanningOutput,
    ) -> Result<()> {
        store.set_joint_generalized_value(Unit::PositionGoal, &out.q_des)?;
        store.set_joint_generalized_value(Unit::VelocityGoal, &out.qd_des)?;
        store.set_joint_generalized_value(Unit::AccelerationGoal, &out.qdd_des)?;

        if self.walk {
            for (f, plan) in out.plans.iter().enumerate() {
                let id = store.foot_ids()[f].clone();
                store.set_foot_value(&id, Unit::PositionGoal, &plan.pos)?;
                store.set_foot_value(&id, Unit::VelocityGoal, &plan.vel)?;
                store.set_foot_value(&id, Unit::AccelerationGoal, &plan.acc)?;
                // the planner's stance commands the foot; a planner-stance
                // foot also counts as active while walking
                model.eefs[f].stance = plan.stance;
                model.eefs[f].active |= plan.stance;
            }
        }

        if self.trunk_stabilization && ctx.jac.num_contacts() > 0 {
            let nj = ctx.q_full.len() - NEULER;
            let rpy = rpy_of(&ctx.q_full, nj);
            let base_twist = DVector::from(ctx.v_full.rows(nj, NSPATIAL));
            let id = trunk_stabilizer(
                &ctx.jac.R,
                &rpy,
                ctx.q_full[nj + 2],
                &base_twist,
                &self.trunk_gains,
            )?;
            debug!(norm = id.norm(), "trunk stabilization forces");
            out.stabilization = Some(id);
        }

        ctx.q_des = out.q_des.clone();
        ctx.qd_des = out.qd_des;
        ctx.qdd_des = out.qdd_des;
        ctx.foot_plans = out.plans;
        if let Some(id) = out.stabilization {
            ctx.uff += id;
        }
        self.prev_q_des = out.q_des;
        Ok(())
    }
}

fn rpy_of(q_full: &DVector<Float>, nj: usize) -> Vector3<Float> {
    let quat = na::Quaternion::new(q_full[nj + 6], q_full[nj + 3], q_full[nj + 4], q_full[nj + 5]);
    let rot = na::UnitQuaternion::from_quaternion(quat);
    let (roll, pitch, yaw) = rot.euler_angles();
    Vector3::new(roll, pitch, yaw)
}

/// CONTROL, feedback half: joint PID or end-effector parallel stiffness.
pub struct FeedbackStage {
    pub pid: JointPid,
    pub parallel_stiffness: bool,
    pub eef_kp: Float,
    pub eef_kv: Float,
}

pub struct FeedbackScratch {
    q: DVector<Float>,
    qd: DVector<Float>,
    q_des: DVector<Float>,
    qd_des: DVector<Float>,
    q_full: DVector<Float>,
    v_full: DVector<Float>,
    x_des: Vec<Vector3<Float>>,
    xd_des: Vec<Vector3<Float>>,
    dt: Float,
}

impl<E: KinematicModel> Stage<E> for FeedbackStage {
    type Scratch = FeedbackScratch;
    type Output = DVector<Float>;

    fn prepare(&mut self, model: &mut RobotModel<E>, ctx: &TickContext) -> Result<FeedbackScratch> {
        let nj = model.num_joint_dofs;
        let (x_des, xd_des) = if ctx.foot_plans.is_empty() {
            (
                model.eefs.iter().map(|e| e.origin).collect(),
                vec![Vector3::zeros(); model.eefs.len()],
            )
        } else {
            (
                ctx.foot_plans.iter().map(|p| p.pos).collect(),
                ctx.foot_plans.iter().map(|p| p.vel).collect(),
            )
        };
        Ok(FeedbackScratch {
            q: DVector::from(ctx.q_full.rows(0, nj)),
            qd: DVector::from(ctx.v_full.rows(0, nj)),
            q_des: ctx.q_des.clone(),
            qd_des: ctx.qd_des.clone(),
            q_full: ctx.q_full.clone(),
            v_full: ctx.v_full.clone(),
            x_des,
            xd_des,
            dt: ctx.dt,
        })
    }

    fn run(&mut self, model: &mut RobotModel<E>, s: FeedbackScratch) -> Result<DVector<Float>> {
        if self.parallel_stiffness {
            let feet: Vec<usize> = (0..model.eefs.len()).collect();
            eef_stiffness_fb(
                model,
                &feet,
                &s.x_des,
                &s.xd_des,
                &s.q_full,
                &s.v_full,
                self.eef_kp,
                self.eef_kv,
            )
        } else {
            self.pid.control(&s.q_des, &s.qd_des, &s.q, &s.qd, s.dt)
        }
    }

    fn commit(
        &mut self,
        _model: &mut RobotModel<E>,
        store: &RobotStateStore,
        ctx: &mut TickContext,
        ufb: DVector<Float>,
    ) -> Result<()> {
        check_finite(&ufb, "ufb")?;
        store.set_data("ufb", Value::Vector(ufb.clone()));
        ctx.ufb = ufb;
        Ok(())
    }
}

/// CONTROL, feed-forward half: friction estimation feeding the constrained
/// inverse dynamics.
pub struct FeedforwardStage {
    pub control_idyn: bool,
    pub friction_estimation: bool,
    pub alpha: Float,
    pub budget: Float,
    pub estimator: FrictionEstimator,
}

pub struct FeedforwardScratch {
    v_full: DVector<Float>,
    qdd_des_full: DVector<Float>,
    M: DMatrix<Float>,
    N: DMatrix<Float>,
    D: DMatrix<Float>,
    fext: DVector<Float>,
    mu: DVector<Float>,
    dt: Float,
}

impl<E: KinematicModel> Stage<E> for FeedforwardStage {
    type Scratch = FeedforwardScratch;
    type Output = (DVector<Float>, DVector<Float>);

    fn prepare(&mut self, model: &mut RobotModel<E>, ctx: &TickContext) -> Result<FeedforwardScratch> {
        let nj = model.num_joint_dofs;
        let mut qdd_des_full = DVector::zeros(model.ndofs);
        qdd_des_full.rows_mut(0, nj).copy_from(&ctx.qdd_des);
        Ok(FeedforwardScratch {
            v_full: ctx.v_full.clone(),
            qdd_des_full,
            M: ctx.M.clone(),
            N: ctx.jac.N.clone(),
            D: ctx.jac.D.clone(),
            fext: ctx.fext.clone(),
            mu: ctx.mu.clone(),
            dt: ctx.dt,
        })
    }

    fn run(
        &mut self,
        model: &mut RobotModel<E>,
        mut s: FeedforwardScratch,
    ) -> Result<(DVector<Float>, DVector<Float>)> {
        let nj = model.num_joint_dofs;

        if self.friction_estimation {
            match self.estimator.estimate(&s.v_full, &s.N, &s.D, &s.M, s.dt) {
                Ok(Some(est)) => {
                    debug!(residual = est.residual, "friction estimate");
                    for i in 0..s.mu.len().min(est.mu.len()) {
                        if est.mu[i].is_finite() {
                            s.mu[i] = est.mu[i];
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "friction estimation failed, keeping prior mu"),
            }
            self.estimator.observe_forces(&s.fext);
        }

        let mut uff = DVector::zeros(nj);
        if self.control_idyn {
            match inverse_dynamics(
                &s.v_full,
                &s.qdd_des_full,
                &s.M,
                &s.N,
                &s.D,
                &s.fext,
                s.dt,
                &s.mu,
                self.budget,
            ) {
                Ok(sol) => {
                    debug!(
                        stage1 = sol.stage1_residual,
                        stage2 = sol.stage2_residual,
                        "inverse dynamics solved"
                    );
                    uff += sol.tau * self.alpha;
                }
                Err(ControlError::LcpUnsolvable) => {
                    warn!("inverse dynamics unsolvable, falling back to PID only");
                }
                Err(ControlError::DeadlineExceeded) => {
                    warn!("inverse dynamics over budget, falling back to PID only");
                }
                Err(e) => return Err(e),
            }
        }
        Ok((uff, s.mu))
    }

    fn commit(
        &mut self,
        _model: &mut RobotModel<E>,
        store: &RobotStateStore,
        ctx: &mut TickContext,
        (uff, mu): (DVector<Float>, DVector<Float>),
    ) -> Result<()> {
        check_finite(&uff, "uff")?;
        store.set_data("uff", Value::Vector(uff.clone()));
        ctx.uff += uff;
        ctx.mu = mu;
        Ok(())
    }
}

/// The controller value constructed at init and passed to every stage.
pub struct Controller<E: KinematicModel> {
    pub config: ControllerConfig,
    pub store: RobotStateStore,
    pub model: RobotModel<E>,
    planning: PlanningStage,
    feedback: FeedbackStage,
    feedforward: FeedforwardStage,
    torque_limits: DVector<Float>,
    qd_prev: Option<DVector<Float>>,
    com_prev: Option<Vector3<Float>>,
    com_vel_prev: Option<Vector3<Float>>,
    fault: Option<ControlError>,
    first_tick: bool,
}

impl<E: KinematicModel> Controller<E> {
    /// Build the controller around an already-assembled robot model. Runs
    /// the INITIALIZATION phase: sizes the store, resolves foot origins,
    /// and hands the store to PERCEPTION.
    pub fn new(mut model: RobotModel<E>, config: ControllerConfig) -> Result<Self> {
        config.validate()?;

        let store = RobotStateStore::new();
        let joint_table: Vec<(String, usize)> = model
            .joints
            .iter()
            .map(|j| (j.id.clone(), j.coords.len()))
            .collect();
        let joint_refs: Vec<(&str, usize)> =
            joint_table.iter().map(|(id, n)| (id.as_str(), *n)).collect();
        store.init_joints(&joint_refs)?;
        let foot_ids: Vec<String> = model.eefs.iter().map(|e| e.id.clone()).collect();
        let foot_refs: Vec<&str> = foot_ids.iter().map(|s| s.as_str()).collect();
        store.init_feet(&foot_refs)?;
        store.init_state()?;

        let gait = config.gait_descriptor()?;
        if config.walk && gait.num_feet() != model.eefs.len() {
            return Err(ControlError::Config(format!(
                "gait table has {} feet, model has {}",
                gait.num_feet(),
                model.eefs.len()
            )));
        }

        // foot origins: configured, or forward kinematics at the home pose
        let nj = model.num_joint_dofs;
        let mut q_home = DVector::zeros(nj + NEULER);
        q_home.rows_mut(0, nj).copy_from(&model.home_pose());
        q_home[nj + 6] = 1.0;
        let v_zero = DVector::zeros(model.ndofs);
        model.set_state(&q_home, &v_zero)?;
        for f in 0..model.eefs.len() {
            let id = model.eefs[f].id.clone();
            model.eefs[f].origin = match config.eef_origins.get(&id) {
                Some(o) => Vector3::new(o[0], o[1], o[2]),
                None => model.foot_position_bh(f, &q_home)?,
            };
        }

        // per-DOF gains and torque limits, config overriding the tables
        let mut gains = Vec::with_capacity(nj);
        let mut limits = model.torque_limits();
        for joint in &model.joints {
            let jc = config.joint(&joint.id);
            for &coord in &joint.coords {
                gains.push(Gains::new(jc.kp, jc.kv, jc.ki));
                if config.joints.contains_key(&joint.id) {
                    limits[coord] = jc.torque_limit;
                }
            }
        }

        let planner = FootPlanner {
            gait,
            phase_time: config.phase_time,
            step_height: config.step_height,
            touchdown_lead: config.touchdown_lead,
        };
        let planning = PlanningStage {
            walk: config.walk,
            trunk_stabilization: config.trunk_stabilization,
            planner,
            body_twist: config.body_twist_vec(),
            trunk_gains: TrunkGains {
                z_ref: q_home[nj + 2],
                ..TrunkGains::default()
            },
            prev_q_des: model.home_pose(),
        };
        let feedback = FeedbackStage {
            pid: JointPid::new(gains, limits.clone()),
            parallel_stiffness: config.parallel_stiffness,
            eef_kp: config.eef_kp,
            eef_kv: config.eef_kv,
        };
        let feedforward = FeedforwardStage {
            control_idyn: config.control_idyn,
            friction_estimation: config.friction_estimation,
            alpha: config.alpha_idyn,
            budget: config.idyn_budget,
            estimator: FrictionEstimator::new(),
        };

        store.end_of_init()?;
        info!(
            num_joint_dofs = nj,
            num_eefs = model.eefs.len(),
            "controller initialized"
        );

        Ok(Controller {
            config,
            store,
            model,
            planning,
            feedback,
            feedforward,
            torque_limits: limits,
            qd_prev: None,
            com_prev: None,
            com_vel_prev: None,
            fault: None,
            first_tick: true,
        })
    }

    /// The safe command: all zeros.
    pub fn zero_command(&self) -> DVector<Float> {
        DVector::zeros(self.model.num_joint_dofs)
    }

    pub fn latched_fault(&self) -> Option<&ControlError> {
        self.fault.as_ref()
    }

    /// Run one control tick. On a fatal error the controller latches the
    /// fault, every later tick fails immediately, and the host should
    /// command [`Controller::zero_command`].
    pub fn control_tick(&mut self, t: Float, sensors: &SensorData) -> Result<DVector<Float>> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        match self.tick_inner(t, sensors) {
            Ok(u) => Ok(u),
            Err(e) => {
                error!(error = %e, "fatal control error, commanding zero torque");
                self.fault = Some(e.clone());
                Err(e)
            }
        }
    }

    fn tick_inner(&mut self, t: Float, sensors: &SensorData) -> Result<DVector<Float>> {
        let nj = self.model.num_joint_dofs;
        let dt = self.config.step_size;

        if self.first_tick {
            self.first_tick = false;
        } else {
            self.store.begin_tick()?;
        }

        // ---------------- PERCEPTION ----------------
        let mut ctx = self.perception(t, dt, sensors)?;

        // ---------------- PLANNING ----------------
        let scratch = self.planning.prepare(&mut self.model, &ctx)?;
        let out = self.planning.run(&mut self.model, scratch)?;
        self.planning.commit(&mut self.model, &self.store, &mut ctx, out)?;

        // ---------------- CONTROL ----------------
        let scratch = self.feedback.prepare(&mut self.model, &ctx)?;
        let out = self.feedback.run(&mut self.model, scratch)?;
        self.feedback.commit(&mut self.model, &self.store, &mut ctx, out)?;

        let scratch = self.feedforward.prepare(&mut self.model, &ctx)?;
        let out = self.feedforward.run(&mut self.model, scratch)?;
        self.feedforward.commit(&mut self.model, &self.store, &mut ctx, out)?;

        let mut u = &ctx.ufb + &ctx.uff;
        clamp_torques(&mut u, &self.torque_limits);
        check_finite(&u, "torque command")?;
        self.store.set_joint_generalized_value(Unit::LoadGoal, &u)?;

        info!(
            nc = ctx.jac.num_contacts(),
            time = t,
            "tick: |ufb| = {:.4}, |uff| = {:.4}",
            ctx.ufb.norm(),
            ctx.uff.norm()
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            for joint in &self.model.joints {
                for &i in &joint.coords {
                    debug!(
                        "{}\t u {:+.4}\t| q {:+.4} des {:+.4}\t| qd {:+.4} des {:+.4}",
                        joint.id, u[i], sensors.q[i], ctx.q_des[i], sensors.qd[i], ctx.qd_des[i]
                    );
                }
            }
        }

        // ---------------- WAITING ----------------
        self.store.end_tick()?;
        self.store.reset_contact()?;
        self.store.clear_foot_flags();
        for eef in &mut self.model.eefs {
            eef.active = false;
        }
        self.qd_prev = Some(DVector::from(sensors.qd.rows(0, nj)));

        Ok(u)
    }

    fn perception(&mut self, t: Float, dt: Float, sensors: &SensorData) -> Result<TickContext> {
        let nj = self.model.num_joint_dofs;

        check_finite(&sensors.q, "sensor q")?;
        check_finite(&sensors.qd, "sensor qd")?;
        check_finite(&sensors.base_pose, "sensor base pose")?;
        check_finite(&sensors.base_twist, "sensor base twist")?;
        if sensors.q.len() != nj || sensors.qd.len() != nj {
            return Err(ControlError::DofMismatch {
                id: "sensor joints".to_string(),
                expected: nj,
                got: sensors.q.len(),
            });
        }

        // measured state into the store
        self.store
            .set_joint_generalized_value(Unit::Position, &sensors.q)?;
        self.store
            .set_joint_generalized_value(Unit::Velocity, &sensors.qd)?;
        self.store.set_base_value(Unit::Position, &sensors.base_pose)?;
        self.store.set_base_value(Unit::Velocity, &sensors.base_twist)?;

        let qdd = match &self.qd_prev {
            Some(prev) => (&sensors.qd - prev) / dt,
            None => DVector::zeros(nj),
        };
        self.store
            .set_joint_generalized_value(Unit::Acceleration, &qdd)?;

        for c in &sensors.contacts {
            self.store.add_contact(c.clone())?;
        }
        let nc_feet = self.model.activate_from_contacts(&sensors.contacts);
        debug!(nc = nc_feet, "active feet from sensed contacts");

        // engine transaction
        let mut q_full = DVector::zeros(nj + NEULER);
        q_full.rows_mut(0, nj).copy_from(&sensors.q);
        q_full.rows_mut(nj, NEULER).copy_from(&sensors.base_pose);
        let mut v_full = DVector::zeros(self.model.ndofs);
        v_full.rows_mut(0, nj).copy_from(&sensors.qd);
        v_full.rows_mut(nj, NSPATIAL).copy_from(&sensors.base_twist);
        self.model.set_state(&q_full, &v_full)?;

        let M = self.model.engine.generalized_inertia();
        let fext = self.model.engine.generalized_forces();
        check_finite_mat(&M, "inertia")?;
        check_finite(&fext, "external forces")?;

        let jac = calc_contact_jacobians(&self.model.engine, &sensors.contacts)?;

        // friction priors: the contact's own coefficient, 1.0 when absent
        let mu = DVector::from_iterator(
            sensors.contacts.len(),
            sensors
                .contacts
                .iter()
                .map(|c| if c.mu_coulomb > 0.0 { c.mu_coulomb } else { 1.0 }),
        );

        // CoM, its derivatives and the ZMP, published for telemetry
        let (com, _mass) = self.model.calc_com()?;
        let com_vel = match &self.com_prev {
            Some(prev) => (com - prev) / dt,
            None => Vector3::zeros(),
        };
        let com_acc = match &self.com_vel_prev {
            Some(prev) => (com_vel - prev) / dt,
            None => Vector3::zeros(),
        };
        let zmp = RobotModel::<E>::calc_zmp(&com, &com_acc);
        self.com_prev = Some(com);
        self.com_vel_prev = Some(com_vel);

        let rpy = self.model.roll_pitch_yaw(&q_full);
        self.store
            .set_data("center_of_mass.x", Value::Vector(DVector::from_column_slice(com.as_slice())));
        self.store.set_data(
            "center_of_mass.xd",
            Value::Vector(DVector::from_column_slice(com_vel.as_slice())),
        );
        self.store.set_data(
            "center_of_mass.xdd",
            Value::Vector(DVector::from_column_slice(com_acc.as_slice())),
        );
        self.store.set_data(
            "zero_moment_point",
            Value::Vector(DVector::from_column_slice(zmp.as_slice())),
        );
        self.store.set_data(
            "roll_pitch_yaw",
            Value::Vector(DVector::from_column_slice(rpy.as_slice())),
        );

        // center of contact: mean active point and a representative normal
        if !sensors.contacts.is_empty() {
            let mut center = Vector3::zeros();
            for c in &sensors.contacts {
                center += c.point / sensors.contacts.len() as Float;
            }
            self.store.set_data(
                "center_of_contact.point",
                Value::Vector(DVector::from_column_slice(center.as_slice())),
            );
            self.store.set_data(
                "center_of_contact.normal",
                Value::Vector(DVector::from_column_slice(
                    sensors.contacts[0].normal.as_slice(),
                )),
            );
        }

        Ok(TickContext {
            t,
            dt,
            q_full,
            v_full,
            qdd,
            M,
            fext,
            jac,
            contacts: sensors.contacts.clone(),
            mu,
            foot_plans: vec![],
            q_des: DVector::from(sensors.q.rows(0, nj)),
            qd_des: sensors.qd.clone(),
            qdd_des: DVector::zeros(nj),
            ufb: DVector::zeros(nj),
            uff: DVector::zeros(nj),
        })
    }
}

#[cfg(test)]
mod controller_tests {
    use super::*;
    use crate::assert_close;
    use crate::config::{ControllerConfig, JointConfig};
    use crate::helpers::{
        build_test_quadruped, home_coordinates, PlanarQuadruped, FOOT_NAMES,
    };
    use crate::state::ControllerPhase;
    use na::vector;

    fn soft_gains() -> std::collections::BTreeMap<String, JointConfig> {
        let mut joints = std::collections::BTreeMap::new();
        for leg in ["LF", "RF", "LH", "RH"] {
            for part in ["HIP_FE", "LEG_FE"] {
                joints.insert(
                    format!("{leg}_{part}"),
                    JointConfig {
                        kp: 20.0,
                        kv: 2.0,
                        ki: 0.0,
                        torque_limit: if part == "HIP_FE" && (leg == "LH" || leg == "RH") {
                            6.0
                        } else {
                            2.6
                        },
                        q0: 0.0,
                    },
                );
            }
        }
        joints
    }

    fn standing_sensors(model: &crate::model::RobotModel<PlanarQuadruped>) -> SensorData {
        let nj = model.num_joint_dofs;
        let q_full = home_coordinates(model);
        let mut engine = PlanarQuadruped::new();
        engine.set_generalized_coordinates(&q_full).unwrap();
        engine.update_link_poses();

        let contacts = FOOT_NAMES
            .iter()
            .map(|name| {
                let (_, p) = engine.link_pose(name).unwrap();
                Contact::new(name, p, vector![0.0, 0.0, 1.0]).with_friction(1.0, 0.0)
            })
            .collect();

        SensorData {
            q: DVector::from(q_full.rows(0, nj)),
            qd: DVector::zeros(nj),
            base_pose: DVector::from(q_full.rows(nj, NEULER)),
            base_twist: DVector::zeros(NSPATIAL),
            contacts,
        }
    }

    fn stand_config() -> ControllerConfig {
        ControllerConfig {
            joints: soft_gains(),
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn standing_tick_emits_bounded_finite_torques() {
        let model = build_test_quadruped();
        let sensors = standing_sensors(&model);
        let mut ctrl = Controller::new(model, stand_config()).unwrap();

        let u = ctrl.control_tick(0.0, &sensors).unwrap();

        assert_eq!(u.len(), 8);
        for (i, &tau) in u.iter().enumerate() {
            assert!(tau.is_finite());
            assert!(tau.abs() <= ctrl.torque_limits[i] + 1e-12);
            assert!(tau.abs() < 1.0, "standing torque {i} = {tau}");
        }
        assert_eq!(ctrl.store.phase(), ControllerPhase::Waiting);
        assert!(ctrl.store.contacts().is_empty());

        // second tick goes through the WAITING -> PERCEPTION transition
        let u2 = ctrl.control_tick(0.01, &sensors).unwrap();
        assert!(u2.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn telemetry_lands_in_the_data_map() {
        let model = build_test_quadruped();
        let sensors = standing_sensors(&model);
        let mut ctrl = Controller::new(model, stand_config()).unwrap();
        ctrl.control_tick(0.0, &sensors).unwrap();

        let com = ctrl.store.get_vector("center_of_mass.x").unwrap();
        assert_eq!(com.len(), 3);
        let zmp = ctrl.store.get_vector("zero_moment_point").unwrap();
        assert_close!(zmp[2], 0.0, 1e-12);
        assert!(ctrl.store.get_vector("ufb").is_ok());
        assert!(ctrl.store.get_vector("uff").is_ok());
    }

    #[test]
    fn nan_sensors_latch_a_fault_and_zero_command() {
        let model = build_test_quadruped();
        let mut sensors = standing_sensors(&model);
        sensors.q[0] = Float::NAN;
        let mut ctrl = Controller::new(model, stand_config()).unwrap();

        let err = ctrl.control_tick(0.0, &sensors).unwrap_err();
        assert!(matches!(err, ControlError::NumericFailure(_)));
        assert!(ctrl.latched_fault().is_some());
        assert_close!(ctrl.zero_command().norm(), 0.0, 1e-12);

        // the fault stays latched
        let sensors_ok = standing_sensors(&build_test_quadruped());
        assert!(ctrl.control_tick(0.01, &sensors_ok).is_err());
    }

    #[test]
    fn deadline_overrun_falls_back_to_pid_only() {
        let model = build_test_quadruped();
        let sensors = standing_sensors(&model);
        let cfg = ControllerConfig {
            idyn_budget: 1e-12,
            joints: soft_gains(),
            ..ControllerConfig::default()
        };
        let mut ctrl = Controller::new(model, cfg).unwrap();

        let u = ctrl.control_tick(0.0, &sensors).unwrap();

        // feed-forward was dropped: the command equals the feedback, which
        // at the exact goal pose is zero
        assert!(ctrl.latched_fault().is_none());
        assert_close!(u.norm(), 0.0, 1e-9);
    }

    #[test]
    fn walking_tick_marks_the_trot_stance_pairs() {
        let model = build_test_quadruped();
        let sensors = standing_sensors(&model);
        let cfg = ControllerConfig {
            walk: true,
            body_twist: [0.1, 0.0, 0.0, 0.0, 0.0, 0.0],
            joints: soft_gains(),
            ..ControllerConfig::default()
        };
        let mut ctrl = Controller::new(model, cfg).unwrap();

        // mid phase 0 of the trot: LF/RH stance, RF/LH swing
        ctrl.control_tick(0.05, &sensors).unwrap();

        let lf = ctrl.store.get_foot_value("LF_FOOT", Unit::PositionGoal).unwrap();
        let rf = ctrl.store.get_foot_value("RF_FOOT", Unit::PositionGoal).unwrap();
        let stand_z = -(crate::helpers::L1 * crate::helpers::Q0_HIP.cos()
            + crate::helpers::L2 * (crate::helpers::Q0_HIP + crate::helpers::Q0_KNEE).cos());
        // stance foot stays on its origin plane, swing foot is lifted to
        // the parabola apex
        assert_close!(lf.z, stand_z, 1e-9);
        assert_close!(rf.z, stand_z + 0.02, 1e-9);
        assert!(ctrl.model.eefs[0].stance);
        assert!(!ctrl.model.eefs[1].stance);

        // goals were planned for the swing legs
        let q_des = ctrl
            .store
            .get_joint_generalized_value(Unit::PositionGoal)
            .unwrap();
        let q = &sensors.q;
        let rf_chain = [2usize, 3];
        assert!(rf_chain.iter().any(|&c| (q_des[c] - q[c]).abs() > 1e-3));
    }

    #[test]
    fn walking_keeps_goal_velocities_for_stance_feet_against_the_twist() {
        let model = build_test_quadruped();
        let sensors = standing_sensors(&model);
        let cfg = ControllerConfig {
            walk: true,
            body_twist: [0.1, 0.0, 0.0, 0.0, 0.0, 0.0],
            joints: soft_gains(),
            ..ControllerConfig::default()
        };
        let mut ctrl = Controller::new(model, cfg).unwrap();
        ctrl.control_tick(0.05, &sensors).unwrap();

        let vel = ctrl.store.get_foot_value("LF_FOOT", Unit::VelocityGoal).unwrap();
        assert_close!(vel.x, -0.1, 1e-9);
    }
}

//! Controller configuration.
//!
//! Deserialized from TOML or built in code via `Default`. Validation runs
//! once at controller construction; a bad value is a `Config` error, never
//! a silent clamp.

use std::collections::BTreeMap;

use na::Vector6;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};
use crate::gait::GaitDescriptor;
use crate::types::Float;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaitChoice {
    Trot,
    Trot2,
    Walk,
    Walk2,
    /// User-supplied phase table.
    Custom(Vec<Vec<i32>>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct JointConfig {
    pub kp: Float,
    pub kv: Float,
    pub ki: Float,
    pub torque_limit: Float,
    pub q0: Float,
}

impl Default for JointConfig {
    fn default() -> Self {
        JointConfig {
            kp: 1e5,
            kv: 1e3,
            ki: 0.0,
            torque_limit: 2.6,
            q0: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub walk: bool,
    pub trunk_stabilization: bool,
    pub control_idyn: bool,
    pub friction_estimation: bool,
    pub parallel_stiffness: bool,

    /// Tick length, seconds.
    pub step_size: Float,
    /// Gait bucket duration, seconds.
    pub phase_time: Float,
    /// Peak swing height, meters.
    pub step_height: Float,
    /// Commanded body twist [vx vy vz wx wy wz] in the body-horizontal
    /// frame.
    pub body_twist: [Float; 6],
    /// Feed-forward weight for the IDYN torques.
    pub alpha_idyn: Float,
    /// Wall budget for one IDYN solve, seconds.
    pub idyn_budget: Float,
    /// Capture-point lead of the swing touchdown, as a fraction of the
    /// stance displacement.
    pub touchdown_lead: Float,

    pub gait: GaitChoice,

    /// Per-joint overrides; joints not listed use the defaults.
    pub joints: BTreeMap<String, JointConfig>,
    /// Nominal foot origins in the body-horizontal frame; feet not listed
    /// fall back to forward kinematics at the home pose.
    pub eef_origins: BTreeMap<String, [Float; 3]>,

    /// Cartesian gains for the parallel-stiffness feedback path.
    pub eef_kp: Float,
    pub eef_kv: Float,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            walk: false,
            trunk_stabilization: false,
            control_idyn: true,
            friction_estimation: false,
            parallel_stiffness: false,
            step_size: 0.01,
            phase_time: 0.1,
            step_height: 0.02,
            body_twist: [0.0; 6],
            alpha_idyn: 1.0,
            idyn_budget: 5e-3,
            touchdown_lead: 0.5,
            gait: GaitChoice::Trot,
            joints: BTreeMap::new(),
            eef_origins: BTreeMap::new(),
            eef_kp: 1e3,
            eef_kv: 1e1,
        }
    }
}

impl ControllerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: ControllerConfig =
            toml::from_str(s).map_err(|e| ControlError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).map_err(|e| ControlError::Config(e.to_string()))?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.step_size <= 0.0 {
            return Err(ControlError::Config(format!(
                "step_size must be positive, got {}",
                self.step_size
            )));
        }
        if self.phase_time <= 0.0 {
            return Err(ControlError::Config(format!(
                "phase_time must be positive, got {}",
                self.phase_time
            )));
        }
        if self.step_height < 0.0 {
            return Err(ControlError::Config(format!(
                "step_height must be nonnegative, got {}",
                self.step_height
            )));
        }
        if !(0.0..=1.0).contains(&self.alpha_idyn) {
            return Err(ControlError::Config(format!(
                "alpha_idyn must lie in [0, 1], got {}",
                self.alpha_idyn
            )));
        }
        if !(0.0..=1.0).contains(&self.touchdown_lead) {
            return Err(ControlError::Config(format!(
                "touchdown_lead must lie in [0, 1], got {}",
                self.touchdown_lead
            )));
        }
        if self.idyn_budget <= 0.0 {
            return Err(ControlError::Config(format!(
                "idyn_budget must be positive, got {}",
                self.idyn_budget
            )));
        }
        self.gait_descriptor().map(|_| ())
    }

    pub fn gait_descriptor(&self) -> Result<GaitDescriptor> {
        match &self.gait {
            GaitChoice::Trot => Ok(GaitDescriptor::trot()),
            GaitChoice::Trot2 => Ok(GaitDescriptor::trot2()),
            GaitChoice::Walk => Ok(GaitDescriptor::walk()),
            GaitChoice::Walk2 => Ok(GaitDescriptor::walk2()),
            GaitChoice::Custom(table) => GaitDescriptor::custom(table.clone()),
        }
    }

    pub fn body_twist_vec(&self) -> Vector6<Float> {
        Vector6::from_row_slice(&self.body_twist)
    }

    /// Configuration for a joint, falling back to the defaults.
    pub fn joint(&self, id: &str) -> JointConfig {
        self.joints.get(id).copied().unwrap_or_default()
    }
}

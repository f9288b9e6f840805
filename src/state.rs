//! Phase-gated robot state store.
//!
//! Every stage of the control loop reads and writes through this store. A
//! write names a [`Unit`]; the unit decides which controller phase the write
//! is legal in, and illegal writes fail with `PhaseViolation`. Reads are
//! phase-agnostic. The store is mutex-protected so perception and telemetry
//! threads can deliver or sample data between ticks.

use std::collections::BTreeMap;
use std::sync::Mutex;

use na::{DMatrix, DVector, Vector3};
use tracing::{debug, info};

use crate::contact::Contact;
use crate::error::{ControlError, Result};
use crate::types::Float;
use crate::{NEULER, NSPATIAL};

/// Semantic unit of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Unit {
    // set during perception
    MiscSensor,
    Position,
    Velocity,
    Acceleration,
    Load,
    // set by the planner
    MiscPlanner,
    PositionGoal,
    VelocityGoal,
    AccelerationGoal,
    // set by the controller
    MiscController,
    LoadGoal,
    // set before the loop starts
    Initialization,
}

impl Unit {
    /// The eight units that carry sized per-joint / per-foot state.
    pub const STATE_UNITS: [Unit; 8] = [
        Unit::Position,
        Unit::PositionGoal,
        Unit::Velocity,
        Unit::VelocityGoal,
        Unit::Acceleration,
        Unit::AccelerationGoal,
        Unit::Load,
        Unit::LoadGoal,
    ];

    /// Auxiliary per-joint units, one per pipeline stage.
    pub const MISC_UNITS: [Unit; 3] = [Unit::MiscSensor, Unit::MiscPlanner, Unit::MiscController];

    /// Pose-valued units use the 7-component Euler pose for the base; the
    /// rest use the 6-component spatial vector.
    pub fn base_len(self) -> usize {
        match self {
            Unit::Position | Unit::PositionGoal => NEULER,
            _ => NSPATIAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Initialization,
    Perception,
    Planning,
    Control,
    Waiting,
}

/// Tagged value for the inter-component data map. Reads with a mismatched
/// tag fail with `TypeMismatch`; raw pointers are unrepresentable here.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(Float),
    Vector(DVector<Float>),
    Matrix(DMatrix<Float>),
    Text(String),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Vector(_) => "vector",
            Value::Matrix(_) => "matrix",
            Value::Text(_) => "text",
        }
    }
}

struct StoreInner {
    phase: ControllerPhase,

    // JOINT_NAME -> {gcoord_dof1, ...}
    dof_map: BTreeMap<String, Vec<usize>>,
    joint_ids: Vec<String>,
    foot_ids: Vec<String>,
    num_joint_dofs: usize,

    joints: BTreeMap<Unit, BTreeMap<String, DVector<Float>>>,
    base: BTreeMap<Unit, DVector<Float>>,
    feet: BTreeMap<Unit, BTreeMap<String, Vector3<Float>>>,
    foot_is_set: BTreeMap<String, bool>,

    contacts: Vec<Contact>,
    data: BTreeMap<String, Value>,
}

impl StoreInner {
    /// Enforce that `u` may be assigned in the current phase. Goal-class
    /// writes advance PERCEPTION -> PLANNING -> CONTROL on first use.
    fn check_phase(&mut self, u: Unit) -> Result<()> {
        let phase = self.phase;
        let ok = match u {
            Unit::Initialization => phase == ControllerPhase::Initialization,
            Unit::MiscSensor | Unit::Position | Unit::Velocity | Unit::Acceleration | Unit::Load => {
                phase == ControllerPhase::Perception
            }
            Unit::MiscPlanner
            | Unit::PositionGoal
            | Unit::VelocityGoal
            | Unit::AccelerationGoal => match phase {
                ControllerPhase::Planning => true,
                ControllerPhase::Perception => {
                    self.advance(ControllerPhase::Planning);
                    true
                }
                _ => false,
            },
            Unit::MiscController | Unit::LoadGoal => match phase {
                ControllerPhase::Control => true,
                ControllerPhase::Planning => {
                    self.advance(ControllerPhase::Control);
                    true
                }
                _ => false,
            },
        };
        if ok {
            Ok(())
        } else {
            Err(ControlError::PhaseViolation { unit: u, phase })
        }
    }

    fn advance(&mut self, to: ControllerPhase) {
        info!(from = ?self.phase, to = ?to, "scheduler: phase change");
        self.phase = to;
    }

    fn joint_dofs(&self, id: &str) -> Result<usize> {
        self.dof_map
            .get(id)
            .map(|d| d.len())
            .ok_or_else(|| ControlError::UnknownId(id.to_string()))
    }
}

/// Process-wide store shared by the control stages and any external
/// perception/telemetry threads.
pub struct RobotStateStore {
    inner: Mutex<StoreInner>,
}

impl Default for RobotStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RobotStateStore {
    pub fn new() -> Self {
        RobotStateStore {
            inner: Mutex::new(StoreInner {
                phase: ControllerPhase::Initialization,
                dof_map: BTreeMap::new(),
                joint_ids: vec![],
                foot_ids: vec![],
                num_joint_dofs: 0,
                joints: BTreeMap::new(),
                base: BTreeMap::new(),
                feet: BTreeMap::new(),
                foot_is_set: BTreeMap::new(),
                contacts: vec![],
                data: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register the joint table: (id, dof count) in generalized-coordinate
    /// order. Only legal during INITIALIZATION.
    pub fn init_joints(&self, joints: &[(&str, usize)]) -> Result<()> {
        let mut inner = self.lock();
        inner.check_phase(Unit::Initialization)?;
        inner.dof_map.clear();
        inner.joint_ids.clear();
        let mut coord = 0;
        for (id, ndofs) in joints {
            let coords: Vec<usize> = (coord..coord + ndofs).collect();
            coord += ndofs;
            inner.dof_map.insert(id.to_string(), coords);
            inner.joint_ids.push(id.to_string());
        }
        inner.num_joint_dofs = coord;
        Ok(())
    }

    pub fn init_feet(&self, feet: &[&str]) -> Result<()> {
        let mut inner = self.lock();
        inner.check_phase(Unit::Initialization)?;
        inner.foot_ids = feet.iter().map(|s| s.to_string()).collect();
        Ok(())
    }

    /// Size and zero every state unit for every registered joint and foot.
    pub fn init_state(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.check_phase(Unit::Initialization)?;
        inner.contacts.clear();
        for u in Unit::STATE_UNITS.into_iter().chain(Unit::MISC_UNITS) {
            let mut jm = BTreeMap::new();
            for id in &inner.joint_ids {
                let n = inner.dof_map[id].len();
                jm.insert(id.clone(), DVector::zeros(n));
            }
            inner.joints.insert(u, jm);

            let mut fm = BTreeMap::new();
            for id in &inner.foot_ids {
                fm.insert(id.clone(), Vector3::zeros());
            }
            inner.feet.insert(u, fm);

            inner.base.insert(u, DVector::zeros(u.base_len()));
        }
        let foot_ids = inner.foot_ids.clone();
        for id in foot_ids {
            inner.foot_is_set.insert(id, false);
        }
        Ok(())
    }

    /// Zero every state unit again. Cleanup work, so only legal during
    /// WAITING (or while still initializing).
    pub fn reset_state(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.phase != ControllerPhase::Waiting && inner.phase != ControllerPhase::Initialization
        {
            return Err(ControlError::PhaseViolation {
                unit: Unit::Initialization,
                phase: inner.phase,
            });
        }
        inner.contacts.clear();
        for (_, jm) in inner.joints.iter_mut() {
            for (_, v) in jm.iter_mut() {
                v.fill(0.0);
            }
        }
        for (_, fm) in inner.feet.iter_mut() {
            for (_, v) in fm.iter_mut() {
                v.fill(0.0);
            }
        }
        for (_, v) in inner.base.iter_mut() {
            v.fill(0.0);
        }
        for (_, set) in inner.foot_is_set.iter_mut() {
            *set = false;
        }
        Ok(())
    }

    pub fn phase(&self) -> ControllerPhase {
        self.lock().phase
    }

    /// INITIALIZATION -> PERCEPTION, at the end of controller construction.
    pub fn end_of_init(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.phase != ControllerPhase::Initialization {
            return Err(ControlError::PhaseTransition {
                from: inner.phase,
                to: ControllerPhase::Perception,
            });
        }
        inner.advance(ControllerPhase::Perception);
        Ok(())
    }

    /// WAITING -> PERCEPTION, at the top of each tick.
    pub fn begin_tick(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.phase != ControllerPhase::Waiting {
            return Err(ControlError::PhaseTransition {
                from: inner.phase,
                to: ControllerPhase::Perception,
            });
        }
        inner.advance(ControllerPhase::Perception);
        Ok(())
    }

    /// CONTROL -> WAITING, at the bottom of each tick.
    pub fn end_tick(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.phase != ControllerPhase::Control {
            return Err(ControlError::PhaseTransition {
                from: inner.phase,
                to: ControllerPhase::Waiting,
            });
        }
        inner.advance(ControllerPhase::Waiting);
        Ok(())
    }

    pub fn num_joint_dofs(&self) -> usize {
        self.lock().num_joint_dofs
    }

    pub fn joint_ids(&self) -> Vec<String> {
        self.lock().joint_ids.clone()
    }

    pub fn foot_ids(&self) -> Vec<String> {
        self.lock().foot_ids.clone()
    }

    pub fn joint_dofs(&self, id: &str) -> Result<usize> {
        self.lock().joint_dofs(id)
    }

    /// ------------ get/set joint values ------------

    pub fn set_joint_value(&self, id: &str, u: Unit, val: &DVector<Float>) -> Result<()> {
        let mut inner = self.lock();
        inner.check_phase(u)?;
        let expected = inner.joint_dofs(id)?;
        if expected != val.len() {
            return Err(ControlError::DofMismatch {
                id: id.to_string(),
                expected,
                got: val.len(),
            });
        }
        if let Some(slot) = inner.joints.get_mut(&u).and_then(|m| m.get_mut(id)) {
            slot.copy_from(val);
            Ok(())
        } else {
            Err(ControlError::UnknownId(id.to_string()))
        }
    }

    pub fn get_joint_value(&self, id: &str, u: Unit) -> Result<DVector<Float>> {
        let inner = self.lock();
        inner
            .joints
            .get(&u)
            .and_then(|m| m.get(id))
            .cloned()
            .ok_or_else(|| ControlError::UnknownId(id.to_string()))
    }

    /// ------------ generalized vector conversions ------------

    /// Scatter a per-joint map into a NUM_JOINT_DOFS vector.
    pub fn convert_to_generalized(
        &self,
        id_dof_val_map: &BTreeMap<String, DVector<Float>>,
    ) -> Result<DVector<Float>> {
        let inner = self.lock();
        let mut generalized = DVector::zeros(inner.num_joint_dofs);
        for (id, val) in id_dof_val_map {
            let dofs = inner
                .dof_map
                .get(id)
                .ok_or_else(|| ControlError::UnknownId(id.clone()))?;
            if dofs.len() != val.len() {
                return Err(ControlError::DofMismatch {
                    id: id.clone(),
                    expected: dofs.len(),
                    got: val.len(),
                });
            }
            for (j, &coord) in dofs.iter().enumerate() {
                generalized[coord] = val[j];
            }
        }
        Ok(generalized)
    }

    /// Gather a NUM_JOINT_DOFS vector into a per-joint map.
    pub fn convert_from_generalized(
        &self,
        generalized: &DVector<Float>,
    ) -> Result<BTreeMap<String, DVector<Float>>> {
        let inner = self.lock();
        if generalized.len() != inner.num_joint_dofs {
            return Err(ControlError::DofMismatch {
                id: "generalized".to_string(),
                expected: inner.num_joint_dofs,
                got: generalized.len(),
            });
        }
        let mut map = BTreeMap::new();
        for (id, dofs) in &inner.dof_map {
            let mut val = DVector::zeros(dofs.len());
            for (j, &coord) in dofs.iter().enumerate() {
                val[j] = generalized[coord];
            }
            map.insert(id.clone(), val);
        }
        Ok(map)
    }

    pub fn set_joint_generalized_value(&self, u: Unit, generalized: &DVector<Float>) -> Result<()> {
        let mut inner = self.lock();
        inner.check_phase(u)?;
        if generalized.len() != inner.num_joint_dofs {
            return Err(ControlError::DofMismatch {
                id: "generalized".to_string(),
                expected: inner.num_joint_dofs,
                got: generalized.len(),
            });
        }
        let dof_map = inner.dof_map.clone();
        let jm = inner
            .joints
            .get_mut(&u)
            .ok_or(ControlError::UnknownId("state unit".to_string()))?;
        for (id, dofs) in &dof_map {
            if let Some(val) = jm.get_mut(id) {
                for (j, &coord) in dofs.iter().enumerate() {
                    val[j] = generalized[coord];
                }
            }
        }
        debug!(unit = ?u, "set joint generalized value");
        Ok(())
    }

    pub fn get_joint_generalized_value(&self, u: Unit) -> Result<DVector<Float>> {
        let inner = self.lock();
        let mut generalized = DVector::zeros(inner.num_joint_dofs);
        let jm = inner
            .joints
            .get(&u)
            .ok_or(ControlError::UnknownId("state unit".to_string()))?;
        for (id, val) in jm {
            let dofs = &inner.dof_map[id];
            for (j, &coord) in dofs.iter().enumerate() {
                generalized[coord] = val[j];
            }
        }
        Ok(generalized)
    }

    /// ------------ base state ------------

    pub fn set_base_value(&self, u: Unit, val: &DVector<Float>) -> Result<()> {
        let mut inner = self.lock();
        inner.check_phase(u)?;
        if val.len() != u.base_len() {
            return Err(ControlError::DofMismatch {
                id: "base".to_string(),
                expected: u.base_len(),
                got: val.len(),
            });
        }
        inner.base.insert(u, val.clone());
        Ok(())
    }

    pub fn get_base_value(&self, u: Unit) -> Result<DVector<Float>> {
        self.lock()
            .base
            .get(&u)
            .cloned()
            .ok_or(ControlError::UnknownId("base".to_string()))
    }

    /// Base-augmented generalized vector: joint part first, base part last.
    pub fn set_generalized_value(&self, u: Unit, val: &DVector<Float>) -> Result<()> {
        let nj = self.num_joint_dofs();
        let expected = nj + u.base_len();
        if val.len() != expected {
            return Err(ControlError::DofMismatch {
                id: "generalized".to_string(),
                expected,
                got: val.len(),
            });
        }
        self.set_joint_generalized_value(u, &DVector::from(val.rows(0, nj)))?;
        self.set_base_value(u, &DVector::from(val.rows(nj, u.base_len())))
    }

    pub fn get_generalized_value(&self, u: Unit) -> Result<DVector<Float>> {
        let joints = self.get_joint_generalized_value(u)?;
        let base = self.get_base_value(u)?;
        let mut out = DVector::zeros(joints.len() + base.len());
        out.rows_mut(0, joints.len()).copy_from(&joints);
        out.rows_mut(joints.len(), base.len()).copy_from(&base);
        Ok(out)
    }

    /// ------------ foot state ------------

    pub fn set_foot_value(&self, id: &str, u: Unit, val: &Vector3<Float>) -> Result<()> {
        let mut inner = self.lock();
        inner.check_phase(u)?;
        if let Some(slot) = inner.feet.get_mut(&u).and_then(|m| m.get_mut(id)) {
            *slot = *val;
            inner.foot_is_set.insert(id.to_string(), true);
            Ok(())
        } else {
            Err(ControlError::UnknownId(id.to_string()))
        }
    }

    pub fn get_foot_value(&self, id: &str, u: Unit) -> Result<Vector3<Float>> {
        self.lock()
            .feet
            .get(&u)
            .and_then(|m| m.get(id))
            .copied()
            .ok_or_else(|| ControlError::UnknownId(id.to_string()))
    }

    pub fn foot_is_set(&self, id: &str) -> bool {
        *self.lock().foot_is_set.get(id).unwrap_or(&false)
    }

    pub fn clear_foot_flags(&self) {
        let mut inner = self.lock();
        for (_, set) in inner.foot_is_set.iter_mut() {
            *set = false;
        }
    }

    /// ------------ contacts ------------

    /// Contacts are sensor data: adding one is a PERCEPTION-class write.
    pub fn add_contact(&self, c: Contact) -> Result<()> {
        let mut inner = self.lock();
        inner.check_phase(Unit::MiscSensor)?;
        debug!(link = %c.id, "contact added");
        inner.contacts.push(c);
        Ok(())
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.lock().contacts.clone()
    }

    pub fn link_contacts(&self, link_id: &str) -> Vec<Contact> {
        self.lock()
            .contacts
            .iter()
            .filter(|c| c.id == link_id)
            .cloned()
            .collect()
    }

    /// Contacts live for one tick; clearing them is WAITING-phase cleanup.
    pub fn reset_contact(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.phase != ControllerPhase::Waiting && inner.phase != ControllerPhase::Initialization
        {
            return Err(ControlError::PhaseViolation {
                unit: Unit::MiscSensor,
                phase: inner.phase,
            });
        }
        inner.contacts.clear();
        Ok(())
    }

    /// ------------ generic data map ------------

    pub fn set_data(&self, key: &str, val: Value) -> bool {
        let mut inner = self.lock();
        inner.data.insert(key.to_string(), val).is_none()
    }

    pub fn remove_data(&self, key: &str) {
        self.lock().data.remove(key);
    }

    pub fn get_data(&self, key: &str) -> Result<Value> {
        self.lock()
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| ControlError::KeyNotFound(key.to_string()))
    }

    pub fn get_scalar(&self, key: &str) -> Result<Float> {
        match self.get_data(key)? {
            Value::Scalar(s) => Ok(s),
            other => Err(ControlError::TypeMismatch {
                key: key.to_string(),
                expected: "scalar",
                got: other.kind(),
            }),
        }
    }

    pub fn get_vector(&self, key: &str) -> Result<DVector<Float>> {
        match self.get_data(key)? {
            Value::Vector(v) => Ok(v),
            other => Err(ControlError::TypeMismatch {
                key: key.to_string(),
                expected: "vector",
                got: other.kind(),
            }),
        }
    }

    pub fn get_matrix(&self, key: &str) -> Result<DMatrix<Float>> {
        match self.get_data(key)? {
            Value::Matrix(m) => Ok(m),
            other => Err(ControlError::TypeMismatch {
                key: key.to_string(),
                expected: "matrix",
                got: other.kind(),
            }),
        }
    }

    pub fn get_text(&self, key: &str) -> Result<String> {
        match self.get_data(key)? {
            Value::Text(t) => Ok(t),
            other => Err(ControlError::TypeMismatch {
                key: key.to_string(),
                expected: "text",
                got: other.kind(),
            }),
        }
    }
}

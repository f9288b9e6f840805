//! Gait scheduling and per-foot reference trajectories.
//!
//! A gait is an ordered sequence of phases; each phase holds one small
//! integer per foot. Positive k means the foot swings with k buckets of the
//! swing window remaining, non-positive -k means it is held in stance with k
//! buckets remaining. From the descriptor and the commanded body twist the
//! planner produces per-foot position/velocity/acceleration references in
//! the body-horizontal frame.

use na::{Vector3, Vector6};

use crate::error::{ControlError, Result};
use crate::types::Float;

#[derive(Debug, Clone, PartialEq)]
pub struct GaitDescriptor {
    phases: Vec<Vec<i32>>,
}

impl GaitDescriptor {
    /// Two-beat diagonal trot: LF/RH and RF/LH alternate, 50% duty.
    pub fn trot() -> Self {
        GaitDescriptor {
            phases: vec![vec![-1, 1, 1, -1], vec![1, -1, -1, 1]],
        }
    }

    /// Four-beat trot with full-stance overlap phases.
    pub fn trot2() -> Self {
        GaitDescriptor {
            phases: vec![
                vec![-3, -1, -1, -3],
                vec![-2, 1, 1, -2],
                vec![-1, -3, -3, -1],
                vec![1, -2, -2, 1],
            ],
        }
    }

    /// Four-beat crawl: one foot in the air at a time, LF RF LH RH order.
    pub fn walk() -> Self {
        GaitDescriptor {
            phases: vec![
                vec![1, -1, -2, -3],
                vec![-3, 1, -1, -2],
                vec![-2, -3, 1, -1],
                vec![-1, -2, -3, 1],
            ],
        }
    }

    /// Four-beat crawl, lateral-sequence order.
    pub fn walk2() -> Self {
        GaitDescriptor {
            phases: vec![
                vec![1, -2, -3, -1],
                vec![-3, -1, -2, 1],
                vec![-2, 1, -1, -3],
                vec![-1, -3, 1, -2],
            ],
        }
    }

    /// A user-supplied phase table. Must be rectangular with at least one
    /// phase and one foot.
    pub fn custom(phases: Vec<Vec<i32>>) -> Result<Self> {
        let nfeet = phases.first().map(|p| p.len()).unwrap_or(0);
        if nfeet == 0 {
            return Err(ControlError::Config("empty gait table".to_string()));
        }
        if phases.iter().any(|p| p.len() != nfeet) {
            return Err(ControlError::Config(
                "gait table is not rectangular".to_string(),
            ));
        }
        Ok(GaitDescriptor { phases })
    }

    pub fn num_phases(&self) -> usize {
        self.phases.len()
    }

    pub fn num_feet(&self) -> usize {
        self.phases[0].len()
    }

    pub fn cycle_time(&self, phase_time: Float) -> Float {
        self.num_phases() as Float * phase_time
    }

    /// Phase index p = floor((t mod |G|·tau) / tau).
    pub fn phase_index(&self, t: Float, phase_time: Float) -> usize {
        let cycle = self.cycle_time(phase_time);
        let in_cycle = t.rem_euclid(cycle);
        ((in_cycle / phase_time) as usize).min(self.num_phases() - 1)
    }

    /// Sub-phase within the current bucket, in [0, 1).
    pub fn subphase(&self, t: Float, phase_time: Float) -> Float {
        (t.rem_euclid(phase_time) / phase_time).clamp(0.0, 1.0)
    }

    pub fn entry(&self, phase: usize, foot: usize) -> i32 {
        self.phases[phase][foot]
    }

    pub fn in_stance(&self, phase: usize, foot: usize) -> bool {
        self.entry(phase, foot) <= 0
    }

    /// Number of stance buckets for a foot over one cycle.
    pub fn stance_len(&self, foot: usize) -> usize {
        self.phases.iter().filter(|p| p[foot] <= 0).count()
    }

    pub fn swing_len(&self, foot: usize) -> usize {
        self.num_phases() - self.stance_len(foot)
    }

    /// Bucket index within the current stance (or swing) window. The entry
    /// magnitude counts the buckets remaining, current included.
    pub fn bucket(&self, phase: usize, foot: usize) -> usize {
        let entry = self.entry(phase, foot);
        let remaining = (entry.unsigned_abs() as usize).max(1);
        let len = if entry <= 0 {
            self.stance_len(foot)
        } else {
            self.swing_len(foot)
        };
        len.saturating_sub(remaining)
    }
}

/// Reference state of one foot, in the body-horizontal frame.
#[derive(Debug, Clone)]
pub struct FootPlan {
    pub pos: Vector3<Float>,
    pub vel: Vector3<Float>,
    pub acc: Vector3<Float>,
    pub stance: bool,
}

/// Generates per-foot references from a gait descriptor and the commanded
/// body twist.
pub struct FootPlanner {
    pub gait: GaitDescriptor,
    /// Duration of one gait bucket, seconds.
    pub phase_time: Float,
    /// Peak swing height, meters.
    pub step_height: Float,
    /// Fraction of the stance displacement the touchdown point is placed
    /// ahead of the foot origin. 0.5 = half a step ahead.
    pub touchdown_lead: Float,
}

impl FootPlanner {
    pub fn new(gait: GaitDescriptor, phase_time: Float, step_height: Float) -> Self {
        FootPlanner {
            gait,
            phase_time,
            step_height,
            touchdown_lead: 0.5,
        }
    }

    /// The velocity the ground appears to move under the body at a foot
    /// origin, for the commanded twist [v; w].
    fn slide_velocity(twist: &Vector6<Float>, origin: &Vector3<Float>) -> Vector3<Float> {
        let v = Vector3::new(twist[0], twist[1], twist[2]);
        let w = Vector3::new(twist[3], twist[4], twist[5]);
        v + w.cross(origin)
    }

    /// Reference for one foot at time t.
    pub fn plan(
        &self,
        t: Float,
        twist: &Vector6<Float>,
        foot: usize,
        origin: &Vector3<Float>,
    ) -> FootPlan {
        let tau = self.phase_time;
        let p = self.gait.phase_index(t, tau);
        let sigma = self.gait.subphase(t, tau);
        let bucket = self.gait.bucket(p, foot) as Float;

        let slide = Self::slide_velocity(twist, origin);
        let stance_len = self.gait.stance_len(foot) as Float;
        let t_stance = stance_len * tau;
        let lead = self.touchdown_lead;

        if self.gait.in_stance(p, foot) {
            // the ground moves backward under the body
            let progress = (bucket + sigma) / stance_len.max(1.0);
            FootPlan {
                pos: origin + slide * t_stance * (lead - progress),
                vel: -slide,
                acc: Vector3::zeros(),
                stance: true,
            }
        } else {
            let swing_len = self.gait.swing_len(foot) as Float;
            let t_swing = swing_len * tau;
            let s = (bucket + sigma) / swing_len.max(1.0);

            let liftoff = origin - slide * t_stance * (1.0 - lead);
            let touchdown = origin + slide * t_stance * lead;

            let mut pos = liftoff + (touchdown - liftoff) * s;
            let mut vel = (touchdown - liftoff) / t_swing.max(crate::NEAR_ZERO);
            // parabolic lift with analytic derivatives
            pos.z += 4.0 * self.step_height * s * (1.0 - s);
            vel.z += 4.0 * self.step_height * (1.0 - 2.0 * s) / t_swing.max(crate::NEAR_ZERO);
            let acc = Vector3::new(
                0.0,
                0.0,
                -8.0 * self.step_height / (t_swing * t_swing).max(crate::NEAR_ZERO),
            );
            FootPlan {
                pos,
                vel,
                acc,
                stance: false,
            }
        }
    }

    /// References for every foot at time t.
    pub fn plan_all(
        &self,
        t: Float,
        twist: &Vector6<Float>,
        origins: &[Vector3<Float>],
    ) -> Vec<FootPlan> {
        origins
            .iter()
            .enumerate()
            .map(|(f, origin)| self.plan(t, twist, f, origin))
            .collect()
    }
}

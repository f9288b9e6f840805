//! Foot-ground contact records.
//!
//! Contacts are delivered from outside at the start of each tick and live
//! for exactly one tick. A contact is a single tagged record; the core never
//! dispatches on a contact subtype.

use na::Vector3;

use crate::types::Float;
use crate::NEAR_ZERO;

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    /// Link the contact lies on.
    pub id: String,
    /// World-frame contact point.
    pub point: Vector3<Float>,
    /// Unit normal, out of the ground.
    pub normal: Vector3<Float>,
    /// First unit tangent; the second is derived orthogonally.
    pub tangent: Vector3<Float>,
    /// Impulse applied at this contact, if the source reports one.
    pub impulse: Vector3<Float>,
    pub mu_coulomb: Float,
    pub mu_viscous: Float,
    pub restitution: Float,
    pub compliant: bool,
}

impl Contact {
    /// Contact with a derived tangent frame, frictionless and rigid by
    /// default.
    pub fn new(id: &str, point: Vector3<Float>, normal: Vector3<Float>) -> Self {
        let normal = normal.normalize();
        Contact {
            id: id.to_string(),
            point,
            normal,
            tangent: orthonormal_tangent(&normal),
            impulse: Vector3::zeros(),
            mu_coulomb: 0.0,
            mu_viscous: 0.0,
            restitution: 0.0,
            compliant: false,
        }
    }

    pub fn with_friction(mut self, mu_coulomb: Float, mu_viscous: Float) -> Self {
        self.mu_coulomb = mu_coulomb;
        self.mu_viscous = mu_viscous;
        self
    }

    pub fn with_tangent(mut self, tangent: Vector3<Float>) -> Self {
        self.tangent = tangent.normalize();
        self
    }

    pub fn with_impulse(mut self, impulse: Vector3<Float>) -> Self {
        self.impulse = impulse;
        self
    }

    /// The two tangents completing an orthonormal frame with the normal.
    pub fn tangent_basis(&self) -> (Vector3<Float>, Vector3<Float>) {
        let t1 = self.tangent;
        let t2 = self.normal.cross(&t1);
        (t1, t2)
    }
}

/// A unit vector orthogonal to `normal`, built from the world axis the
/// normal is least aligned with.
pub fn orthonormal_tangent(normal: &Vector3<Float>) -> Vector3<Float> {
    let axis = if normal.x.abs() < normal.z.abs() {
        Vector3::x()
    } else {
        Vector3::z()
    };
    let t = normal.cross(&axis);
    if t.norm() < NEAR_ZERO {
        // normal was (anti)parallel to the chosen axis
        normal.cross(&Vector3::y()).normalize()
    } else {
        t.normalize()
    }
}

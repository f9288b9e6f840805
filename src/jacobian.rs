//! Contact-Jacobian assembly.
//!
//! From the active contacts, builds the generalized-force maps used by the
//! friction-pyramid formulations: N (normals), S and T (tangent basis), and
//! D = [S T -S -T] per contact. The base rows ride along in every column,
//! which is what couples contact impulses to the unactuated DOFs.

use na::DMatrix;

use crate::contact::Contact;
use crate::error::Result;
use crate::model::KinematicModel;
use crate::types::Float;
use crate::NK;

#[derive(Debug, Clone)]
pub struct ContactJacobians {
    /// NDOF x nc, column i = J_i' * n_i.
    pub N: DMatrix<Float>,
    /// NDOF x nc, first tangent.
    pub S: DMatrix<Float>,
    /// NDOF x nc, second tangent.
    pub T: DMatrix<Float>,
    /// NDOF x nc*NK, blocks [S_i T_i -S_i -T_i] per contact.
    pub D: DMatrix<Float>,
    /// [N D] stacked side by side, NDOF x nc*(1+NK).
    pub R: DMatrix<Float>,
}

impl ContactJacobians {
    pub fn num_contacts(&self) -> usize {
        self.N.ncols()
    }

    pub fn empty(ndofs: usize) -> Self {
        ContactJacobians {
            N: DMatrix::zeros(ndofs, 0),
            S: DMatrix::zeros(ndofs, 0),
            T: DMatrix::zeros(ndofs, 0),
            D: DMatrix::zeros(ndofs, 0),
            R: DMatrix::zeros(ndofs, 0),
        }
    }
}

/// Build N, S, T and D for the given contacts at the engine's current
/// configuration.
pub fn calc_contact_jacobians<E: KinematicModel>(
    engine: &E,
    contacts: &[Contact],
) -> Result<ContactJacobians> {
    let ndofs = engine.num_joint_dofs() + crate::NSPATIAL;
    let nc = contacts.len();

    let mut N = DMatrix::zeros(ndofs, nc);
    let mut S = DMatrix::zeros(ndofs, nc);
    let mut T = DMatrix::zeros(ndofs, nc);

    for (i, c) in contacts.iter().enumerate() {
        let J = engine.point_jacobian(&c.id, &c.point)?;
        let J_lin = J.rows(0, 3).into_owned();
        let (t1, t2) = c.tangent_basis();

        N.set_column(i, &(J_lin.transpose() * c.normal));
        S.set_column(i, &(J_lin.transpose() * t1));
        T.set_column(i, &(J_lin.transpose() * t2));
    }

    let mut D = DMatrix::zeros(ndofs, nc * NK);
    for i in 0..nc {
        D.set_column(i * NK, &S.column(i));
        D.set_column(i * NK + 1, &T.column(i));
        D.set_column(i * NK + 2, &(-S.column(i)));
        D.set_column(i * NK + 3, &(-T.column(i)));
    }

    let mut R = DMatrix::zeros(ndofs, nc + nc * NK);
    R.view_mut((0, 0), (ndofs, nc)).copy_from(&N);
    R.view_mut((0, nc), (ndofs, nc * NK)).copy_from(&D);

    Ok(ContactJacobians { N, S, T, D, R })
}

#[cfg(test)]
mod jacobian_tests {
    use super::*;
    use crate::assert_close;
    use crate::helpers::{build_test_quadruped, home_coordinates, PlanarQuadruped};
    use na::{vector, DVector};

    fn standing_engine() -> PlanarQuadruped {
        let model = build_test_quadruped();
        let mut engine = PlanarQuadruped::new();
        engine
            .set_generalized_coordinates(&home_coordinates(&model))
            .unwrap();
        engine.update_link_poses();
        engine
    }

    fn ground_contacts(engine: &PlanarQuadruped) -> Vec<Contact> {
        crate::helpers::FOOT_NAMES
            .iter()
            .map(|name| {
                let (_, p) = engine.link_pose(name).unwrap();
                Contact::new(name, p, vector![0.0, 0.0, 1.0]).with_friction(1.0, 0.0)
            })
            .collect()
    }

    #[test]
    fn shapes_follow_the_contact_count() {
        let engine = standing_engine();
        let contacts = ground_contacts(&engine);

        let jac = calc_contact_jacobians(&engine, &contacts).unwrap();

        let ndofs = PlanarQuadruped::NJ + crate::NSPATIAL;
        assert_eq!(jac.N.shape(), (ndofs, 4));
        assert_eq!(jac.S.shape(), (ndofs, 4));
        assert_eq!(jac.T.shape(), (ndofs, 4));
        assert_eq!(jac.D.shape(), (ndofs, 4 * NK));
        assert_eq!(jac.R.shape(), (ndofs, 4 + 4 * NK));
        assert_eq!(jac.num_contacts(), 4);
    }

    #[test]
    fn normal_columns_lift_the_base() {
        // a unit normal impulse at any foot pushes the base straight up
        let engine = standing_engine();
        let contacts = ground_contacts(&engine);
        let jac = calc_contact_jacobians(&engine, &contacts).unwrap();

        let nj = PlanarQuadruped::NJ;
        for i in 0..4 {
            assert_close!(jac.N[(nj, i)], 0.0, 1e-12); // no x force
            assert_close!(jac.N[(nj + 1, i)], 0.0, 1e-12); // no y force
            assert_close!(jac.N[(nj + 2, i)], 1.0, 1e-12); // unit z force
        }
    }

    #[test]
    fn pyramid_blocks_negate_the_tangent_pair() {
        let engine = standing_engine();
        let contacts = ground_contacts(&engine);
        let jac = calc_contact_jacobians(&engine, &contacts).unwrap();

        for i in 0..4 {
            let s = jac.S.column(i);
            let t = jac.T.column(i);
            let d0 = jac.D.column(i * NK);
            let d2 = jac.D.column(i * NK + 2);
            let d1 = jac.D.column(i * NK + 1);
            let d3 = jac.D.column(i * NK + 3);
            assert_close!((d0 - s).norm(), 0.0, 1e-12);
            assert_close!((d2 + s).norm(), 0.0, 1e-12);
            assert_close!((d1 - t).norm(), 0.0, 1e-12);
            assert_close!((d3 + t).norm(), 0.0, 1e-12);
        }
    }

    #[test]
    fn generalized_force_balances_external_push() {
        // R maps impulses to generalized forces: with all four normals
        // loaded equally, the base z row sees the sum
        let engine = standing_engine();
        let contacts = ground_contacts(&engine);
        let jac = calc_contact_jacobians(&engine, &contacts).unwrap();

        let z = DVector::from_element(4, 0.25);
        let gf = &jac.N * z;
        assert_close!(gf[PlanarQuadruped::NJ + 2], 1.0, 1e-12);
    }
}

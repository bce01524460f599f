//! **coupled_derivs**: partial-derivative declarations, global Jacobian
//! assembly and block-Jacobi linear solves for coupled component models.
//!
//! Pipeline:
//!
//! 1. **Declarations** (`declare`, `pattern`): glob-expanded `(of, wrt)` blocks, validated and normalized.
//! 2. **Components** (`component`): variables, blocks, local apply/solve operators.
//! 3. **Model** (`model`): connections, global layout, linearization.
//! 4. **Assembly** (`assembly`): one fixed-structure global Jacobian (dense, COO or CSR).
//! 5. **Solver** (`solver`): block Jacobi in forward or reverse mode over named right-hand sides.
//! 6. **Totals** (`totals`): total derivatives through the coupled system.

pub mod types;
pub mod pattern;
pub mod declare;
pub mod linalg;
pub mod component;
pub mod vectors;
pub mod model;
pub mod assembly;
pub mod solver;
pub mod totals;

pub use component::Component;
pub use declare::{PartialDeclaration, PartialValue, SubJacobian};
pub use model::Model;
pub use solver::{BlockJacobi, LocalOperator, LocalSolveError, Transfer};
pub use totals::{compute_totals, TotalJacobian};
pub use types::{DerivError, JacobianMode, LinearSolverOptions, MatrixFormat, Mode, SolveReport};

//! Block-sparse matrix functionality for fvrelin.
//!
//! The global Jacobian of a system with `num_eq` equations per degree of freedom is stored
//! as a square matrix of dense `num_eq x num_eq` blocks. The block sparsity pattern is shared
//! through an [`Arc`](std::sync::Arc) and never changes after construction, only the block
//! values do.

mod block;

pub use block::*;

pub extern crate nalgebra_sparse;

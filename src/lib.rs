//! Assembly of the global Jacobian of a finite volume discretization with
//! partial relinearization.
//!
//! The central type is [`JacobianAssembler`](assembly::JacobianAssembler). On every Newton
//! iteration it only re-evaluates the local linearization of cells whose degrees of freedom
//! moved further than a tolerance since the last linearization, as classified by the
//! [coloring engine](coloring::ColoringEngine). Classification is reconciled across process
//! partitions through a [`Communicator`](comm::Communicator).
//!
//! The [`newton`] module contains the hooks a Newton driver calls into, along with a small
//! driver that uses them.

use nalgebra::RealField;

pub mod assembly;
pub mod color;
pub mod comm;
pub mod coloring;
pub mod config;
pub mod local;
pub mod newton;
pub mod recycling;
pub mod sparsity;
pub mod stencil;

#[cfg(feature = "proptest")]
pub mod proptest;

pub extern crate fvrelin_sparse;
pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

pub use assembly::{AssemblyError, AssemblyReport, JacobianAssembler};
pub use color::EntityColor;
pub use config::AssemblerSettings;

/// A real scalar type that can be used for assembly.
///
/// Used as a trait alias for the traits frequently needed by generic `fvrelin` routines.
pub trait Real: RealField + Copy {}

impl<T> Real for T where T: RealField + Copy {}

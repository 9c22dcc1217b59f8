//! Control plane assembly
//!
//! Builds, wires, starts and stops the coordination components as one unit.

pub mod control_plane;

pub use control_plane::{ControlPlane, TOGGLES_TARGET};

//! Compute-unit provisioning.
//!
//! The `Provisioner` trait is the seam to whatever actually creates machines;
//! `ProvisioningCoordinator` owns retry, orphan and reclaim policy on top of it.

pub mod coordinator;
pub mod provisioner;
pub mod simulated;

pub use coordinator::{
    CoordinatorSettings, ProvisionOutcome, ProvisioningCoordinator, ReclaimOutcome,
};
pub use provisioner::{INPUT_KEY_TAG, Provisioner, ProvisionerError, UnitTags};
pub use simulated::{Autopilot, SignalSink, SimulatedProvisioner, SimulatedUnit};

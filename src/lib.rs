//! Calibration and quality control of 1D NMR spectra against a standard
//! operating procedure (SOP).
//!
//! A batch of raw spectra is validated, referenced to a known signal,
//! checked for line width, baseline and residual solvent, binned onto a
//! fixed feature grid and finally aggregated into sample and feature
//! summary tables for reporting.

pub mod aggregate;
pub mod data;
pub mod error;
pub mod qc;
pub mod sop;
pub mod spectrum;
pub mod stats;
pub mod synthetic;

pub use error::{QcError, Result};
pub use sop::Sop;

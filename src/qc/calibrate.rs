use log::{debug, warn};
use serde::Serialize;

use super::peak::PeakLocator;
use crate::sop::{AlignTo, Sop};
use crate::spectrum::{PpmInterval, Spectrum};

/// Result of chemical-shift referencing.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub spectrum: Spectrum,
    pub outcome: CalibrationOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationOutcome {
    /// Applied shift in ppm, 0 when nothing was applied.
    pub shift_ppm: f64,
    /// Reference position before shifting, when one was found.
    pub reference_ppm: Option<f64>,
    pub failed: bool,
}

/// Aligns the reference signal to the SOP's `calibrateTo` position.
#[derive(Debug, Clone, Copy)]
pub struct Calibrator {
    locator: PeakLocator,
    align_to: AlignTo,
    calibrate_to: f64,
    search_range: PpmInterval,
}

impl Calibrator {
    pub fn from_sop(sop: &Sop) -> Self {
        Calibrator {
            locator: PeakLocator::from_sop(sop),
            align_to: sop.align_to,
            calibrate_to: sop.calibrate_to,
            search_range: sop.ppm_search_range,
        }
    }

    /// Never fails: a missing reference sets the failure flag and leaves
    /// the spectrum where it was.
    pub fn calibrate(&self, spectrum: Spectrum) -> Calibration {
        let Some(multiplicity) = self.align_to.multiplicity() else {
            return Calibration {
                spectrum,
                outcome: CalibrationOutcome {
                    shift_ppm: 0.0,
                    reference_ppm: None,
                    failed: false,
                },
            };
        };

        match self.locator.locate(&spectrum, &self.search_range, multiplicity) {
            Ok(peak) => {
                let shift = self.calibrate_to - peak.centroid_ppm;
                debug!(
                    "{}: {multiplicity} at {:.5} ppm, shifting by {shift:+.5}",
                    spectrum.sample_id(),
                    peak.centroid_ppm
                );
                Calibration {
                    spectrum: spectrum.shifted(shift),
                    outcome: CalibrationOutcome {
                        shift_ppm: shift,
                        reference_ppm: Some(peak.centroid_ppm),
                        failed: false,
                    },
                }
            }
            Err(e) => {
                warn!("{}: calibration failed: {e}", spectrum.sample_id());
                Calibration {
                    spectrum,
                    outcome: CalibrationOutcome {
                        shift_ppm: 0.0,
                        reference_ppm: None,
                        failed: true,
                    },
                }
            }
        }
    }
}

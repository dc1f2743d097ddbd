//! Per-sample quality control.
//!
//! ```text
//!   Spectrum
//!      │
//!      ▼
//!  ┌───────────┐   PeakLocator   ┌─────────────────────┐
//!  │ calibrate │ ◀────────────── │ peak                │
//!  └───────────┘                 └─────────────────────┘
//!      │                                    ▲
//!      ▼                                    │
//!  ┌───────────────────────────┐            │
//!  │ linewidth ∥ regions       │ ───────────┘
//!  └───────────────────────────┘
//!      │
//!      ▼
//!  ┌───────────┐
//!  │   mask    │  bins → FeatureVector with excluded bins
//!  └───────────┘
//!      │
//!      ▼
//!   QcRecord   (evaluate: state machine + worker pool)
//! ```

pub mod calibrate;
pub mod evaluate;
pub mod linewidth;
pub mod mask;
pub mod peak;
pub mod regions;

pub use evaluate::{
    evaluate_batch, BatchEvaluation, QcFlags, QcRecord, Rejection, SampleOutcome, SampleQCEvaluator,
};
pub use mask::FeatureVector;

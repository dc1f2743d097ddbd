//! Data layer: raw spectra in, QC tables out.
//!
//! Architecture:
//! ```text
//!  .parquet / .json / .csv
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  loader   │  parse file → SpectralDataset
//!   └──────────┘
//!        │
//!        ▼
//!   ┌────────────────┐
//!   │ SpectralDataset │  Vec<RawSpectrum> in file order
//!   └────────────────┘
//!        │   filename: regex groups → metadata
//!        ▼
//!      (qc, aggregate)
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  export   │  sample / feature / intensity CSV + report JSON
//!   └──────────┘
//! ```

pub mod export;
pub mod filename;
pub mod loader;
pub mod model;

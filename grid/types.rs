// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Mul};

/// A single complex visibility sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Visibility {
    pub re: f32,
    pub im: f32,
}

impl Visibility {
    pub const ZERO: Visibility = Visibility { re: 0.0, im: 0.0 };
    pub const ONE: Visibility = Visibility { re: 1.0, im: 0.0 };

    #[inline]
    pub const fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    #[inline]
    pub fn norm_sqr(self) -> f32 {
        self.re * self.re + self.im * self.im
    }
}

impl Add for Visibility {
    type Output = Visibility;

    #[inline]
    fn add(self, rhs: Visibility) -> Visibility {
        Visibility::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl AddAssign for Visibility {
    #[inline]
    fn add_assign(&mut self, rhs: Visibility) {
        self.re += rhs.re;
        self.im += rhs.im;
    }
}

impl Mul<f32> for Visibility {
    type Output = Visibility;

    #[inline]
    fn mul(self, rhs: f32) -> Visibility {
        Visibility::new(self.re * rhs, self.im * rhs)
    }
}

/// The visibility column a pass reads from (or, in predict mode, writes to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataColumn {
    #[serde(alias = "data")]
    Observed,
    Corrected,
    Model,
}

impl DataColumn {
    /// The measurement-set column name backing this selector.
    pub fn table_name(self) -> &'static str {
        match self {
            DataColumn::Observed => "DATA",
            DataColumn::Corrected => "CORRECTED_DATA",
            DataColumn::Model => "MODEL_DATA",
        }
    }
}

impl fmt::Display for DataColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// What a pass does with each row-buffer. Resolved once per pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImagingMode {
    /// Grid unit visibilities to accumulate the sum of weights.
    Weight,
    /// Grid unit visibilities to form the point spread function.
    Psf,
    /// PSF gridding used for SNR-weighted imaging.
    SnrPsf,
    /// Grid the selected data column.
    Residual,
    /// Degrid model visibilities from the grid and write them back.
    Predict,
}

impl ImagingMode {
    pub fn is_predict(self) -> bool {
        matches!(self, ImagingMode::Predict)
    }

    /// Whether the accumulate path grids unit visibilities instead of data.
    pub fn psf_only(self) -> bool {
        matches!(
            self,
            ImagingMode::Weight | ImagingMode::Psf | ImagingMode::SnrPsf
        )
    }

    /// The column used when the caller does not name one.
    pub fn default_column(self) -> DataColumn {
        match self {
            ImagingMode::Predict => DataColumn::Model,
            _ => DataColumn::Corrected,
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "weight" => Ok(ImagingMode::Weight),
            "psf" => Ok(ImagingMode::Psf),
            "snrpsf" => Ok(ImagingMode::SnrPsf),
            "residual" => Ok(ImagingMode::Residual),
            "predict" => Ok(ImagingMode::Predict),
            other => Err(format!(
                "Unknown imaging mode '{other}'. Expected one of: weight, psf, snrpsf, residual, predict."
            )),
        }
    }
}

impl fmt::Display for ImagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImagingMode::Weight => "weight",
            ImagingMode::Psf => "psf",
            ImagingMode::SnrPsf => "snrpsf",
            ImagingMode::Residual => "residual",
            ImagingMode::Predict => "predict",
        };
        f.write_str(name)
    }
}

/// A spectral window selected for imaging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralWindow {
    pub id: u32,
    pub ref_freq_hz: f64,
}

/// One row-buffer of visibility data: the unit handed to a single gridding call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisBuffer {
    pub spectral_window: u32,
    /// Baseline coordinates in wavelengths, one entry per row.
    pub uvw: Vec<[f64; 3]>,
    pub weight: Vec<f32>,
    pub observed: Vec<Visibility>,
    pub corrected: Option<Vec<Visibility>>,
    pub model: Option<Vec<Visibility>>,
}

impl VisBuffer {
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.uvw.len()
    }

    /// The visibilities held in `column`, if the buffer carries that column.
    pub fn vis_cube(&self, column: DataColumn) -> Option<&[Visibility]> {
        match column {
            DataColumn::Observed => Some(&self.observed),
            DataColumn::Corrected => self.corrected.as_deref(),
            DataColumn::Model => self.model.as_deref(),
        }
    }
}

/// The outcome of one gridding pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PassSummary {
    pub row_buffers: usize,
    pub rows: u64,
    pub gridding_seconds: f64,
}

impl PassSummary {
    /// Rows per second spent inside the gridding engine.
    pub fn data_rate(&self) -> f64 {
        if self.gridding_seconds > 0.0 {
            self.rows as f64 / self.gridding_seconds
        } else {
            0.0
        }
    }
}

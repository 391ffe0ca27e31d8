// ========================================================================================
//
//                          A REFERENCE CPU GRIDDING ENGINE
//
// ========================================================================================
//
// The production engine lives on the device. This one is a deliberately plain host
// implementation of the same interface: nearest-cell gridding with a separable tapered
// kernel, and the matching degridder for predict. It exists so that a pass can run end
// to end on any machine, and so that overlapped and single-threaded runs can be compared
// cell for cell.

use crate::coordinator::StagedKernel;
use crate::driver::{CollaboratorError, GriddingEngine};
use crate::types::{DataColumn, SpectralWindow, VisBuffer, Visibility};
use ahash::AHashMap;
use log::debug;
use ndarray::Array2;
use std::sync::Arc;

/// A set of convolution kernels staged for one spectral window.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSet {
    pub window: SpectralWindow,
    /// Half-width of the kernel in grid cells.
    pub support: usize,
    /// Separable taps, `2 * support + 1` of them, normalized to sum to one.
    pub taps: Vec<f32>,
}

impl KernelSet {
    /// Builds a Gaussian taper whose width scales with the window's reference frequency.
    pub fn tapered(window: SpectralWindow, support: usize, reference_hz: f64) -> Self {
        let scale = if window.ref_freq_hz > 0.0 && reference_hz > 0.0 {
            (window.ref_freq_hz / reference_hz) as f32
        } else {
            1.0
        };
        let width = (support.max(1) as f32 * 0.5 * scale).max(0.25);
        let mut taps: Vec<f32> = (-(support as isize)..=support as isize)
            .map(|offset| {
                let x = offset as f32 / width;
                (-x * x).exp()
            })
            .collect();
        let total: f32 = taps.iter().sum();
        for tap in &mut taps {
            *tap /= total;
        }
        Self {
            window,
            support,
            taps,
        }
    }
}

/// Builds and caches kernel sets per spectral window.
///
/// `prepare` returns `None` when the currently published set still applies: either the
/// window did not change, or a single set serves every window.
pub struct KernelCache {
    windows: AHashMap<u32, SpectralWindow>,
    reference_hz: f64,
    support: usize,
    single_set: bool,
    cache: AHashMap<u32, StagedKernel<KernelSet>>,
    last: Option<u32>,
}

impl KernelCache {
    pub fn new(windows: &[SpectralWindow], support: usize, single_set: bool) -> Self {
        let reference_hz = windows.first().map_or(0.0, |w| w.ref_freq_hz);
        Self {
            windows: windows.iter().map(|w| (w.id, *w)).collect(),
            reference_hz,
            support,
            single_set,
            cache: AHashMap::new(),
            last: None,
        }
    }

    pub fn prepare_window(
        &mut self,
        window_id: u32,
    ) -> Result<Option<StagedKernel<KernelSet>>, CollaboratorError> {
        if self.last == Some(window_id) || (self.single_set && self.last.is_some()) {
            return Ok(None);
        }
        let window = *self
            .windows
            .get(&window_id)
            .ok_or_else(|| format!("spectral window {window_id} was not selected for imaging"))?;

        let kernels = match self.cache.get(&window_id) {
            Some(cached) => Arc::clone(cached),
            None => {
                debug!(
                    "Building kernel set for SPW {} (ref. freq. {} Hz).",
                    window.id, window.ref_freq_hz
                );
                let built = Arc::new(KernelSet::tapered(window, self.support, self.reference_hz));
                self.cache.insert(window_id, Arc::clone(&built));
                built
            }
        };
        self.last = Some(window_id);
        Ok(Some(kernels))
    }

    /// Number of distinct kernel sets built so far.
    pub fn built(&self) -> usize {
        self.cache.len()
    }
}

/// Grids onto a square host-resident grid.
pub struct CpuGridder {
    grid: Array2<Visibility>,
    cell_lambda: f64,
    sum_of_weights: f64,
    kernels: Option<StagedKernel<KernelSet>>,
    /// Present when the engine stages its own kernels, i.e. without a CF server.
    inline_kernels: Option<KernelCache>,
}

impl CpuGridder {
    pub fn new(grid_size: usize, cell_lambda: f64) -> Self {
        Self {
            grid: Array2::from_elem((grid_size, grid_size), Visibility::ZERO),
            cell_lambda,
            sum_of_weights: 0.0,
            kernels: None,
            inline_kernels: None,
        }
    }

    /// Makes the engine build kernels itself as the spectral window changes.
    pub fn with_inline_kernels(mut self, cache: KernelCache) -> Self {
        self.inline_kernels = Some(cache);
        self
    }

    pub fn grid(&self) -> &Array2<Visibility> {
        &self.grid
    }

    pub fn sum_of_weights(&self) -> f64 {
        self.sum_of_weights
    }

    /// Seeds the grid, e.g. with the transform of a model image before predict.
    pub fn set_grid(&mut self, grid: Array2<Visibility>) -> Result<(), CollaboratorError> {
        if grid.dim() != self.grid.dim() {
            return Err(format!(
                "model grid shape {:?} does not match engine grid shape {:?}",
                grid.dim(),
                self.grid.dim()
            )
            .into());
        }
        self.grid = grid;
        Ok(())
    }

    fn active_kernels(&mut self, vb: &VisBuffer) -> Result<StagedKernel<KernelSet>, CollaboratorError> {
        if let Some(cache) = &mut self.inline_kernels {
            if let Some(kernels) = cache.prepare_window(vb.spectral_window)? {
                self.kernels = Some(kernels);
            }
        }
        self.kernels
            .clone()
            .ok_or_else(|| "no convolution kernels loaded for gridding".into())
    }

    /// Grid cell nearest to a baseline, or `None` when the kernel footprint leaves the grid.
    fn cell_of(&self, uvw: &[f64; 3], support: usize) -> Option<(usize, usize)> {
        let (nx, ny) = self.grid.dim();
        let half = (nx / 2) as f64;
        let iu = (uvw[0] / self.cell_lambda).round() + half;
        let iv = (uvw[1] / self.cell_lambda).round() + (ny / 2) as f64;
        let lo = support as f64;
        if !iu.is_finite() || !iv.is_finite() {
            return None;
        }
        if iu < lo || iv < lo || iu + lo >= nx as f64 || iv + lo >= ny as f64 {
            return None;
        }
        Some((iu as usize, iv as usize))
    }
}

impl GriddingEngine for CpuGridder {
    type Kernel = KernelSet;

    fn load_kernels(&mut self, kernels: StagedKernel<KernelSet>) -> Result<(), CollaboratorError> {
        debug!("Loaded kernel set for SPW {}.", kernels.window.id);
        self.kernels = Some(kernels);
        Ok(())
    }

    fn put(
        &mut self,
        vb: &VisBuffer,
        column: DataColumn,
        psf_only: bool,
    ) -> Result<(), CollaboratorError> {
        let kernels = self.active_kernels(vb)?;
        let data = vb
            .vis_cube(column)
            .ok_or_else(|| format!("row-buffer has no {column} column"))?;
        if data.len() != vb.n_rows() {
            return Err(format!(
                "{column} holds {} visibilities for a row-buffer of {} rows",
                data.len(),
                vb.n_rows()
            )
            .into());
        }
        let support = kernels.support;

        for (row, uvw) in vb.uvw.iter().enumerate() {
            let weight = vb.weight.get(row).copied().unwrap_or(1.0);
            let sample = if psf_only { Visibility::ONE } else { data[row] };
            self.sum_of_weights += f64::from(weight);
            let Some((cu, cv)) = self.cell_of(uvw, support) else {
                continue;
            };
            for (dx, tx) in kernels.taps.iter().enumerate() {
                for (dy, ty) in kernels.taps.iter().enumerate() {
                    self.grid[[cu + dx - support, cv + dy - support]] += sample * (weight * tx * ty);
                }
            }
        }
        Ok(())
    }

    fn get(&mut self, vb: &VisBuffer) -> Result<Vec<Visibility>, CollaboratorError> {
        let kernels = self.active_kernels(vb)?;
        let support = kernels.support;
        let model = vb
            .uvw
            .iter()
            .map(|uvw| {
                let Some((cu, cv)) = self.cell_of(uvw, support) else {
                    return Visibility::ZERO;
                };
                let mut acc = Visibility::ZERO;
                for (dx, tx) in kernels.taps.iter().enumerate() {
                    for (dy, ty) in kernels.taps.iter().enumerate() {
                        acc += self.grid[[cu + dx - support, cv + dy - support]] * (tx * ty);
                    }
                }
                acc
            })
            .collect();
        Ok(model)
    }
}

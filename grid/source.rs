// ========================================================================================
//                          In-memory visibility source
// ========================================================================================
//
// Holds a whole observation as chunks of row-buffers. The binary fills one with a
// synthetic observation; tests build them by hand.

use crate::driver::{CollaboratorError, VisibilitySource};
use crate::types::{DataColumn, SpectralWindow, VisBuffer, Visibility};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

pub struct MemorySource {
    chunks: Vec<Vec<VisBuffer>>,
    has_corrected: bool,
    has_model: bool,
    chunk: usize,
    row_buffer: usize,
}

impl MemorySource {
    /// A column counts as present only when every row-buffer carries it.
    pub fn new(chunks: Vec<Vec<VisBuffer>>) -> Self {
        let all = |f: fn(&VisBuffer) -> bool| chunks.iter().flatten().all(f);
        let has_corrected = all(|vb| vb.corrected.is_some());
        let has_model = all(|vb| vb.model.is_some());
        Self {
            chunks,
            has_corrected,
            has_model,
            chunk: 0,
            row_buffer: 0,
        }
    }

    pub fn chunks(&self) -> &[Vec<VisBuffer>] {
        &self.chunks
    }

    pub fn row_buffer_count(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    fn current_mut(&mut self) -> Result<&mut VisBuffer, CollaboratorError> {
        self.chunks
            .get_mut(self.chunk)
            .and_then(|chunk| chunk.get_mut(self.row_buffer))
            .ok_or_else(|| "no current row-buffer to write to".into())
    }
}

impl VisibilitySource for MemorySource {
    fn origin_chunks(&mut self) {
        self.chunk = 0;
        self.row_buffer = 0;
    }

    fn more_chunks(&self) -> bool {
        self.chunk < self.chunks.len()
    }

    fn next_chunk(&mut self) {
        self.chunk += 1;
        self.row_buffer = 0;
    }

    fn origin(&mut self) {
        self.row_buffer = 0;
    }

    fn more(&self) -> bool {
        self.chunks
            .get(self.chunk)
            .is_some_and(|chunk| self.row_buffer < chunk.len())
    }

    fn next(&mut self) {
        self.row_buffer += 1;
    }

    fn vis_buffer(&self) -> &VisBuffer {
        &self.chunks[self.chunk][self.row_buffer]
    }

    fn has_column(&self, column: DataColumn) -> bool {
        match column {
            DataColumn::Observed => true,
            DataColumn::Corrected => self.has_corrected,
            DataColumn::Model => self.has_model,
        }
    }

    fn total_rows(&self) -> u64 {
        self.chunks.iter().flatten().map(|vb| vb.n_rows() as u64).sum()
    }

    fn write_model(&mut self, model: &[Visibility]) -> Result<(), CollaboratorError> {
        let vb = self.current_mut()?;
        if model.len() != vb.n_rows() {
            return Err(format!(
                "model has {} visibilities for a row-buffer of {} rows",
                model.len(),
                vb.n_rows()
            )
            .into());
        }
        vb.model = Some(model.to_vec());
        Ok(())
    }

    /// Empty chunks inherit the window of the chunk before them, so staging never asks
    /// for kernels of a window nobody observed.
    fn chunk_spectral_windows(&self) -> Vec<u32> {
        let first = self
            .chunks
            .iter()
            .flatten()
            .next()
            .map_or(0, |vb| vb.spectral_window);
        let mut last = first;
        self.chunks
            .iter()
            .map(|chunk| {
                if let Some(vb) = chunk.first() {
                    last = vb.spectral_window;
                }
                last
            })
            .collect()
    }
}

/// Shape of a synthetic observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObservationLayout {
    /// Row-buffers in each chunk, in iteration order.
    pub row_buffers_per_chunk: Vec<usize>,
    pub rows_per_row_buffer: usize,
    pub with_corrected: bool,
    pub with_model: bool,
    /// Longest baseline in wavelengths.
    pub max_baseline_lambda: f64,
}

impl Default for ObservationLayout {
    fn default() -> Self {
        Self {
            row_buffers_per_chunk: vec![10, 5, 7],
            rows_per_row_buffer: 64,
            with_corrected: true,
            with_model: true,
            max_baseline_lambda: 200.0,
        }
    }
}

/// Builds a deterministic observation: baselines trace a slow spiral in the uv-plane and
/// the visibilities are those of a unit point source slightly off the phase centre.
///
/// Chunk `i` observes `windows[i % windows.len()]`, scaled by its reference frequency.
pub fn synthetic_observation(layout: &ObservationLayout, windows: &[SpectralWindow]) -> MemorySource {
    let reference_hz = windows.first().map_or(1.0, |w| w.ref_freq_hz);
    let total: usize = layout.row_buffers_per_chunk.iter().sum::<usize>() * layout.rows_per_row_buffer;
    let mut row = 0usize;

    let chunks: Vec<Vec<VisBuffer>> = layout
        .row_buffers_per_chunk
        .iter()
        .enumerate()
        .map(|(chunk_index, &row_buffers)| {
            let window = windows.get(chunk_index % windows.len().max(1)).copied();
            let spw = window.map_or(0, |w| w.id);
            let scale = window.map_or(1.0, |w| w.ref_freq_hz / reference_hz);
            (0..row_buffers)
                .map(|_| {
                    let mut uvw = Vec::with_capacity(layout.rows_per_row_buffer);
                    let mut observed = Vec::with_capacity(layout.rows_per_row_buffer);
                    for _ in 0..layout.rows_per_row_buffer {
                        let t = row as f64 / total.max(1) as f64;
                        let radius = layout.max_baseline_lambda * (0.05 + 0.95 * t) * scale;
                        let angle = 17.0 * TAU * t;
                        let (u, v) = (radius * angle.cos(), radius * angle.sin());
                        let phase = TAU * (0.01 * u - 0.02 * v);
                        uvw.push([u, v, 0.0]);
                        observed.push(Visibility::new(phase.cos() as f32, phase.sin() as f32));
                        row += 1;
                    }
                    let n = observed.len();
                    VisBuffer {
                        spectral_window: spw,
                        uvw,
                        weight: vec![1.0; n],
                        corrected: layout.with_corrected.then(|| observed.clone()),
                        model: layout.with_model.then(|| vec![Visibility::ZERO; n]),
                        observed,
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect();

    MemorySource::new(chunks)
}

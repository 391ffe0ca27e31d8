// ========================================================================================
//
//                          THE CHUNK / ROW-BUFFER DRIVER
//
// ========================================================================================
//
// This module walks the visibility data for one gridding pass and feeds it, one
// row-buffer at a time, to the gridding engine. It is the only place that knows the
// shape of the iteration: an outer loop over chunks and an inner loop over the
// row-buffers of a chunk.
//
// Coordination with a CF staging thread is threaded through two hooks. At the top of
// every chunk the driver waits for a kernel set to be ready; after every row-buffer it
// reports that the row-buffer was gridded. In single-threaded runs both hooks are
// no-ops, so the overlapped and non-overlapped runs share this exact code path.

use crate::coordinator::StagedKernel;
use crate::progress::PassProgressObserver;
use crate::types::{DataColumn, ImagingMode, PassSummary, VisBuffer, Visibility};
use log::{debug, info, trace, warn};
use std::error::Error;
use std::time::Instant;
use thiserror::Error;

/// The error type collaborators (sources, engines, stagers) report through.
pub type CollaboratorError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum PassError {
    #[error("MODEL_DATA column not found. Required for mode=predict.")]
    MissingModelColumn,
    #[error("The requested data column ({0}) for mode={1} was not found.")]
    MissingColumn(DataColumn, ImagingMode),
    #[error("Gridding engine failed: {0}")]
    Engine(String),
    #[error("Visibility source failed: {0}")]
    Source(String),
    #[error("CF staging thread failed: {0}")]
    Staging(String),
}

// Enables `?` on collaborator results inside the driver.
impl From<CollaboratorError> for PassError {
    fn from(e: CollaboratorError) -> Self {
        PassError::Engine(e.to_string())
    }
}

/// Chunked access to visibility data.
pub trait VisibilitySource {
    /// Positions the source before the first chunk.
    fn origin_chunks(&mut self);
    fn more_chunks(&self) -> bool;
    fn next_chunk(&mut self);
    /// Positions the source at the first row-buffer of the current chunk.
    fn origin(&mut self);
    fn more(&self) -> bool;
    fn next(&mut self);
    /// The current row-buffer. Only valid while [`Self::more`] is true.
    fn vis_buffer(&self) -> &VisBuffer;
    fn has_column(&self, column: DataColumn) -> bool;
    fn total_rows(&self) -> u64;
    /// Writes model visibilities for the current row-buffer.
    fn write_model(&mut self, model: &[Visibility]) -> Result<(), CollaboratorError>;
    /// Spectral window of every chunk, in iteration order. Used to schedule kernel staging.
    fn chunk_spectral_windows(&self) -> Vec<u32>;
}

/// The FFT gridding / degridding engine.
pub trait GriddingEngine {
    type Kernel;

    /// Switches the engine to a newly staged kernel set.
    fn load_kernels(&mut self, kernels: StagedKernel<Self::Kernel>)
    -> Result<(), CollaboratorError>;
    /// Grids one row-buffer.
    fn put(
        &mut self,
        vb: &VisBuffer,
        column: DataColumn,
        psf_only: bool,
    ) -> Result<(), CollaboratorError>;
    /// Degrids model visibilities for one row-buffer.
    fn get(&mut self, vb: &VisBuffer) -> Result<Vec<Visibility>, CollaboratorError>;
}

/// What the driver does at the top of a chunk.
pub enum KernelGate<K> {
    /// Grid the chunk, switching kernels first if a new set was published.
    Proceed(Option<StagedKernel<K>>),
    /// Stop the pass.
    EndOfData,
}

/// Coordination points threaded through the iteration.
pub trait PassHooks<K> {
    fn wait_for_kernel_ready(&mut self) -> KernelGate<K>;
    /// Called after the row-buffer at `index_in_chunk` has been handed to the engine.
    fn row_buffer_gridded(&mut self, index_in_chunk: usize);
    /// Called once a chunk's row-buffers are exhausted.
    fn chunk_finished(&mut self, row_buffers_in_chunk: usize) {
        let _ = row_buffers_in_chunk;
    }
}

/// Hooks for single-threaded runs: never wait, never signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl<K> PassHooks<K> for NoopHooks {
    fn wait_for_kernel_ready(&mut self) -> KernelGate<K> {
        KernelGate::Proceed(None)
    }

    fn row_buffer_gridded(&mut self, index_in_chunk: usize) {
        let _ = index_in_chunk;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    RunningChunk,
    RunningRowBuffer,
    Done,
    /// The pass ended with an error.
    Failed,
}

/// Position of the driver within a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChunkCursor {
    pub chunk: usize,
    pub row_buffer: usize,
    pub row_buffers: usize,
    pub rows: u64,
    pub gridding_seconds: f64,
}

impl ChunkCursor {
    fn summary(&self) -> PassSummary {
        PassSummary {
            row_buffers: self.row_buffers,
            rows: self.rows,
            gridding_seconds: self.gridding_seconds,
        }
    }
}

/// The column chosen for a pass and whether it is a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnChoice {
    pub column: DataColumn,
    pub fell_back: bool,
}

/// Picks the data column for a pass. Corrected data is preferred; without it the pass
/// falls back to the observed column.
pub fn resolve_column<S: VisibilitySource + ?Sized>(
    source: &S,
    mode: ImagingMode,
    requested: Option<DataColumn>,
) -> Result<ColumnChoice, PassError> {
    if mode.is_predict() {
        return if source.has_column(DataColumn::Model) {
            Ok(ColumnChoice {
                column: DataColumn::Model,
                fell_back: false,
            })
        } else {
            Err(PassError::MissingModelColumn)
        };
    }

    match requested.unwrap_or_else(|| mode.default_column()) {
        DataColumn::Corrected if !source.has_column(DataColumn::Corrected) => Ok(ColumnChoice {
            column: DataColumn::Observed,
            fell_back: true,
        }),
        column if source.has_column(column) => Ok(ColumnChoice {
            column,
            fell_back: false,
        }),
        column => Err(PassError::MissingColumn(column, mode)),
    }
}

/// Settings fixed for the lifetime of a pass.
#[derive(Debug, Clone, Copy)]
pub struct PassSettings {
    pub mode: ImagingMode,
    pub column: Option<DataColumn>,
    /// Only the root role reports progress.
    pub is_root: bool,
}

pub struct IterationDriver<P> {
    settings: PassSettings,
    progress: P,
    state: DriverState,
    cursor: ChunkCursor,
}

impl<P: PassProgressObserver> IterationDriver<P> {
    pub fn new(settings: PassSettings, progress: P) -> Self {
        Self {
            settings,
            progress,
            state: DriverState::Idle,
            cursor: ChunkCursor::default(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn cursor(&self) -> ChunkCursor {
        self.cursor
    }

    /// Runs one gridding pass over `source`.
    ///
    /// Returns the number of row-buffers and rows processed and the cumulative wall-clock
    /// time spent gridding. Errors from the engine or the source end the pass and leave the
    /// driver in [`DriverState::Failed`].
    pub fn run_pass<S, E, H>(
        &mut self,
        source: &mut S,
        engine: &mut E,
        hooks: &mut H,
    ) -> Result<PassSummary, PassError>
    where
        S: VisibilitySource + ?Sized,
        E: GriddingEngine,
        H: PassHooks<E::Kernel>,
    {
        self.state = DriverState::Idle;
        self.cursor = ChunkCursor::default();

        let outcome = self.iterate(source, engine, hooks);
        self.state = match outcome {
            Ok(_) => DriverState::Done,
            Err(_) => DriverState::Failed,
        };
        outcome
    }

    fn iterate<S, E, H>(
        &mut self,
        source: &mut S,
        engine: &mut E,
        hooks: &mut H,
    ) -> Result<PassSummary, PassError>
    where
        S: VisibilitySource + ?Sized,
        E: GriddingEngine,
        H: PassHooks<E::Kernel>,
    {
        let choice = resolve_column(&*source, self.settings.mode, self.settings.column)?;
        if choice.fell_back {
            warn!("CORRECTED_DATA column not found. Using the DATA column instead.");
        } else if choice.column == DataColumn::Model && !self.settings.mode.is_predict() {
            info!("Using MODEL_DATA column.");
        }
        let column = choice.column;
        let psf_only = self.settings.mode.psf_only();

        if self.settings.is_root {
            self.progress.on_pass_start(source.total_rows());
        }

        source.origin_chunks();
        while source.more_chunks() {
            self.state = DriverState::RunningChunk;
            source.origin();

            match hooks.wait_for_kernel_ready() {
                KernelGate::EndOfData => {
                    debug!("End of data observed before chunk {}.", self.cursor.chunk);
                    break;
                }
                KernelGate::Proceed(Some(kernels)) => engine.load_kernels(kernels)?,
                KernelGate::Proceed(None) => {}
            }

            let chunk_start = Instant::now();
            self.cursor.row_buffer = 0;
            while source.more() {
                self.state = DriverState::RunningRowBuffer;
                let rows = self.grid_row_buffer(source, engine, column, psf_only)?;
                hooks.row_buffer_gridded(self.cursor.row_buffer);

                self.cursor.rows += rows;
                self.cursor.row_buffer += 1;
                self.cursor.row_buffers += 1;
                source.next();
            }
            hooks.chunk_finished(self.cursor.row_buffer);
            self.cursor.gridding_seconds += chunk_start.elapsed().as_secs_f64();
            trace!(
                "Chunk {} done: {} row-buffers, {} rows so far.",
                self.cursor.chunk, self.cursor.row_buffer, self.cursor.rows
            );

            if self.settings.is_root {
                self.progress.on_rows_processed(self.cursor.rows);
            }
            self.cursor.chunk += 1;
            source.next_chunk();
        }

        if self.settings.is_root {
            self.progress.on_pass_finish();
        }
        Ok(self.cursor.summary())
    }

    fn grid_row_buffer<S, E>(
        &self,
        source: &mut S,
        engine: &mut E,
        column: DataColumn,
        psf_only: bool,
    ) -> Result<u64, PassError>
    where
        S: VisibilitySource + ?Sized,
        E: GriddingEngine,
    {
        let vb = source.vis_buffer();
        let rows = vb.n_rows() as u64;
        if self.settings.mode.is_predict() {
            let model = engine.get(vb)?;
            source
                .write_model(&model)
                .map_err(|e| PassError::Source(e.to_string()))?;
        } else {
            engine.put(vb, column, psf_only)?;
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopPassProgress;
    use std::sync::Arc;

    /// A source with a fixed chunk layout; every row-buffer carries `rows` rows.
    struct LayoutSource {
        layout: Vec<usize>,
        rows: usize,
        corrected: bool,
        model: bool,
        chunk: usize,
        row_buffer: usize,
        vb: VisBuffer,
        written: usize,
    }

    impl LayoutSource {
        fn new(layout: Vec<usize>, rows: usize) -> Self {
            let vb = VisBuffer {
                spectral_window: 0,
                uvw: vec![[0.0; 3]; rows],
                weight: vec![1.0; rows],
                observed: vec![Visibility::ONE; rows],
                corrected: Some(vec![Visibility::ONE; rows]),
                model: Some(vec![Visibility::ZERO; rows]),
            };
            Self {
                layout,
                rows,
                corrected: true,
                model: true,
                chunk: 0,
                row_buffer: 0,
                vb,
                written: 0,
            }
        }
    }

    impl VisibilitySource for LayoutSource {
        fn origin_chunks(&mut self) {
            self.chunk = 0;
        }
        fn more_chunks(&self) -> bool {
            self.chunk < self.layout.len()
        }
        fn next_chunk(&mut self) {
            self.chunk += 1;
        }
        fn origin(&mut self) {
            self.row_buffer = 0;
        }
        fn more(&self) -> bool {
            self.row_buffer < self.layout[self.chunk]
        }
        fn next(&mut self) {
            self.row_buffer += 1;
        }
        fn vis_buffer(&self) -> &VisBuffer {
            &self.vb
        }
        fn has_column(&self, column: DataColumn) -> bool {
            match column {
                DataColumn::Observed => true,
                DataColumn::Corrected => self.corrected,
                DataColumn::Model => self.model,
            }
        }
        fn total_rows(&self) -> u64 {
            (self.layout.iter().sum::<usize>() * self.rows) as u64
        }
        fn write_model(&mut self, model: &[Visibility]) -> Result<(), CollaboratorError> {
            assert_eq!(model.len(), self.rows);
            self.written += 1;
            Ok(())
        }
        fn chunk_spectral_windows(&self) -> Vec<u32> {
            vec![0; self.layout.len()]
        }
    }

    #[derive(Default)]
    struct RecordingEngine {
        puts: Vec<(DataColumn, bool)>,
        gets: usize,
        loaded: Vec<u32>,
        fail_after: Option<usize>,
    }

    impl GriddingEngine for RecordingEngine {
        type Kernel = u32;

        fn load_kernels(&mut self, kernels: StagedKernel<u32>) -> Result<(), CollaboratorError> {
            self.loaded.push(*kernels);
            Ok(())
        }
        fn put(
            &mut self,
            _vb: &VisBuffer,
            column: DataColumn,
            psf_only: bool,
        ) -> Result<(), CollaboratorError> {
            if self.fail_after == Some(self.puts.len()) {
                return Err("device out of memory".into());
            }
            self.puts.push((column, psf_only));
            Ok(())
        }
        fn get(&mut self, vb: &VisBuffer) -> Result<Vec<Visibility>, CollaboratorError> {
            self.gets += 1;
            Ok(vec![Visibility::ZERO; vb.n_rows()])
        }
    }

    /// Hooks that count every interaction and hand out scripted gates.
    #[derive(Default)]
    struct CountingHooks {
        waits: usize,
        gridded: Vec<usize>,
        finished: Vec<usize>,
        end_of_data_at: Option<usize>,
    }

    impl PassHooks<u32> for CountingHooks {
        fn wait_for_kernel_ready(&mut self) -> KernelGate<u32> {
            let chunk = self.waits;
            self.waits += 1;
            if self.end_of_data_at == Some(chunk) {
                KernelGate::EndOfData
            } else {
                KernelGate::Proceed(Some(Arc::new(chunk as u32)))
            }
        }
        fn row_buffer_gridded(&mut self, index_in_chunk: usize) {
            self.gridded.push(index_in_chunk);
        }
        fn chunk_finished(&mut self, row_buffers_in_chunk: usize) {
            self.finished.push(row_buffers_in_chunk);
        }
    }

    fn settings(mode: ImagingMode) -> PassSettings {
        PassSettings {
            mode,
            column: None,
            is_root: true,
        }
    }

    #[test]
    fn counts_every_row_buffer_across_chunks() {
        let mut source = LayoutSource::new(vec![10, 5, 7], 4);
        let mut engine = RecordingEngine::default();
        let mut hooks = CountingHooks::default();
        let mut driver = IterationDriver::new(settings(ImagingMode::Residual), NoopPassProgress);

        let summary = driver.run_pass(&mut source, &mut engine, &mut hooks).unwrap();

        assert_eq!(summary.row_buffers, 22);
        assert_eq!(summary.rows, 88);
        assert_eq!(hooks.waits, 3);
        assert_eq!(hooks.finished, vec![10, 5, 7]);
        assert_eq!(hooks.gridded.iter().filter(|&&i| i == 0).count(), 3);
        assert_eq!(engine.loaded, vec![0, 1, 2]);
        assert!(engine.puts.iter().all(|p| *p == (DataColumn::Corrected, false)));
        assert_eq!(driver.state(), DriverState::Done);
    }

    #[test]
    fn zero_chunks_yield_zero_summary_without_hook_calls() {
        let mut source = LayoutSource::new(vec![], 4);
        let mut engine = RecordingEngine::default();
        let mut hooks = CountingHooks::default();
        let mut driver = IterationDriver::new(settings(ImagingMode::Residual), NoopPassProgress);

        let summary = driver.run_pass(&mut source, &mut engine, &mut hooks).unwrap();

        assert_eq!(summary, PassSummary::default());
        assert_eq!(hooks.waits, 0);
        assert!(hooks.gridded.is_empty());
    }

    #[test]
    fn end_of_data_on_first_chunk_is_a_clean_empty_pass() {
        let mut source = LayoutSource::new(vec![3, 3], 4);
        let mut engine = RecordingEngine::default();
        let mut hooks = CountingHooks {
            end_of_data_at: Some(0),
            ..Default::default()
        };
        let mut driver = IterationDriver::new(settings(ImagingMode::Residual), NoopPassProgress);

        let summary = driver.run_pass(&mut source, &mut engine, &mut hooks).unwrap();

        assert_eq!(summary, PassSummary::default());
        assert!(engine.puts.is_empty());
    }

    #[test]
    fn end_of_data_mid_pass_stops_at_the_chunk_boundary() {
        let mut source = LayoutSource::new(vec![2, 2, 2], 1);
        let mut engine = RecordingEngine::default();
        let mut hooks = CountingHooks {
            end_of_data_at: Some(1),
            ..Default::default()
        };
        let mut driver = IterationDriver::new(settings(ImagingMode::Residual), NoopPassProgress);

        let summary = driver.run_pass(&mut source, &mut engine, &mut hooks).unwrap();

        assert_eq!(summary.row_buffers, 2);
        assert_eq!(driver.cursor().chunk, 1);
    }

    #[test]
    fn psf_modes_grid_with_psf_flag() {
        let mut source = LayoutSource::new(vec![1], 2);
        let mut engine = RecordingEngine::default();
        let mut driver = IterationDriver::new(settings(ImagingMode::Psf), NoopPassProgress);

        driver
            .run_pass(&mut source, &mut engine, &mut NoopHooks)
            .unwrap();

        assert_eq!(engine.puts, vec![(DataColumn::Corrected, true)]);
    }

    #[test]
    fn predict_mode_degrids_and_writes_back() {
        let mut source = LayoutSource::new(vec![2, 1], 3);
        let mut engine = RecordingEngine::default();
        let mut driver = IterationDriver::new(settings(ImagingMode::Predict), NoopPassProgress);

        let summary = driver
            .run_pass(&mut source, &mut engine, &mut NoopHooks)
            .unwrap();

        assert_eq!(summary.rows, 9);
        assert_eq!(engine.gets, 3);
        assert!(engine.puts.is_empty());
        assert_eq!(source.written, 3);
    }

    #[test]
    fn predict_without_model_column_is_rejected_before_iterating() {
        let mut source = LayoutSource::new(vec![2], 3);
        source.model = false;
        let mut engine = RecordingEngine::default();
        let mut hooks = CountingHooks::default();
        let mut driver = IterationDriver::new(settings(ImagingMode::Predict), NoopPassProgress);

        let err = driver
            .run_pass(&mut source, &mut engine, &mut hooks)
            .unwrap_err();

        assert!(matches!(err, PassError::MissingModelColumn));
        assert_eq!(hooks.waits, 0);
    }

    #[test]
    fn missing_corrected_column_falls_back_to_observed() {
        let mut source = LayoutSource::new(vec![2], 1);
        source.corrected = false;

        let choice = resolve_column(&source, ImagingMode::Residual, None).unwrap();
        assert_eq!(
            choice,
            ColumnChoice {
                column: DataColumn::Observed,
                fell_back: true
            }
        );

        let mut engine = RecordingEngine::default();
        let mut driver = IterationDriver::new(settings(ImagingMode::Residual), NoopPassProgress);
        driver
            .run_pass(&mut source, &mut engine, &mut NoopHooks)
            .unwrap();
        assert!(engine.puts.iter().all(|p| p.0 == DataColumn::Observed));
    }

    #[test]
    fn explicitly_requested_missing_model_column_is_an_error() {
        let mut source = LayoutSource::new(vec![1], 1);
        source.model = false;
        let err =
            resolve_column(&source, ImagingMode::Residual, Some(DataColumn::Model)).unwrap_err();
        assert!(matches!(
            err,
            PassError::MissingColumn(DataColumn::Model, ImagingMode::Residual)
        ));
    }

    #[test]
    fn engine_errors_propagate_out_of_the_pass() {
        let mut source = LayoutSource::new(vec![4], 1);
        let mut engine = RecordingEngine {
            fail_after: Some(2),
            ..Default::default()
        };
        let mut driver = IterationDriver::new(settings(ImagingMode::Residual), NoopPassProgress);

        let err = driver
            .run_pass(&mut source, &mut engine, &mut NoopHooks)
            .unwrap_err();

        assert!(err.to_string().contains("device out of memory"));
        assert_eq!(driver.cursor().row_buffers, 2);
        assert_eq!(driver.state(), DriverState::Failed);
    }

    #[test]
    fn a_failed_pass_can_be_followed_by_a_clean_one() {
        let mut source = LayoutSource::new(vec![2], 1);
        source.model = false;
        let mut driver = IterationDriver::new(settings(ImagingMode::Predict), NoopPassProgress);
        let mut engine = RecordingEngine::default();
        assert!(driver
            .run_pass(&mut source, &mut engine, &mut NoopHooks)
            .is_err());
        assert_eq!(driver.state(), DriverState::Failed);

        source.model = true;
        driver
            .run_pass(&mut source, &mut engine, &mut NoopHooks)
            .unwrap();
        assert_eq!(driver.state(), DriverState::Done);
    }

    #[derive(Default)]
    struct RecordingProgress {
        totals: Vec<u64>,
        updates: Vec<u64>,
        finished: bool,
    }

    impl PassProgressObserver for RecordingProgress {
        fn on_pass_start(&mut self, total_rows: u64) {
            self.totals.push(total_rows);
        }
        fn on_rows_processed(&mut self, rows_done: u64) {
            self.updates.push(rows_done);
        }
        fn on_pass_finish(&mut self) {
            self.finished = true;
        }
    }

    #[test]
    fn only_the_root_reports_progress() {
        let mut source = LayoutSource::new(vec![1, 2], 5);
        let mut engine = RecordingEngine::default();

        let mut root = IterationDriver::new(settings(ImagingMode::Residual), RecordingProgress::default());
        root.run_pass(&mut source, &mut engine, &mut NoopHooks)
            .unwrap();
        assert_eq!(root.progress.totals, vec![15]);
        assert_eq!(root.progress.updates, vec![5, 15]);
        assert!(root.progress.finished);

        let mut worker = IterationDriver::new(
            PassSettings {
                is_root: false,
                ..settings(ImagingMode::Residual)
            },
            RecordingProgress::default(),
        );
        worker
            .run_pass(&mut source, &mut engine, &mut NoopHooks)
            .unwrap();
        assert!(worker.progress.totals.is_empty());
        assert!(worker.progress.updates.is_empty());
    }
}

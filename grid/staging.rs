// ========================================================================================
//
//                              THE CF STAGING THREAD
//
// ========================================================================================
//
// Overlaps the preparation of convolution-function (kernel) sets with gridding. A
// dedicated "cf-server" thread walks the per-chunk spectral-window schedule ahead of
// the driver: it prepares the kernel set for the next chunk while the driver is still
// gridding the current one, publishes it through the coordinator, and then waits until
// the driver has started on it before preparing the one after.
//
// The protocol per chunk, from the staging side:
//
//   1. Stop if end-of-data has been raised.
//   2. Prepare the kernel set (or learn that the published one still applies).
//   3. Install it, then signal "ready". Always in that order.
//   4. Wait for "consumed".
//
// When the schedule is exhausted, or anything fails, the thread raises end-of-data and
// signals "ready" one last time so a driver blocked at the top of a chunk is released.

use crate::coordinator::{HandshakeCoordinator, StagedKernel};
use crate::driver::{
    CollaboratorError, GriddingEngine, IterationDriver, KernelGate, PassError, PassHooks,
    VisibilitySource,
};
use crate::engine::{KernelCache, KernelSet};
use crate::progress::PassProgressObserver;
use crate::types::{PassSummary, SpectralWindow};
use log::{debug, error, info};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Prepares kernel sets on the staging thread.
pub trait KernelStager: Send {
    type Kernel: Send + Sync + 'static;

    /// Returns `None` when the kernel set already published still serves `window`.
    fn prepare(
        &mut self,
        window: &SpectralWindow,
    ) -> Result<Option<StagedKernel<Self::Kernel>>, CollaboratorError>;
}

impl KernelStager for KernelCache {
    type Kernel = KernelSet;

    fn prepare(
        &mut self,
        window: &SpectralWindow,
    ) -> Result<Option<StagedKernel<KernelSet>>, CollaboratorError> {
        self.prepare_window(window.id)
    }
}

/// What the staging thread did during one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingReport {
    /// Chunks for which "ready" was signalled.
    pub chunks_served: usize,
    /// Newly installed kernel sets.
    pub sets_published: usize,
    /// Chunks that kept the previously published set.
    pub sets_reused: usize,
    /// Whether end-of-data was raised by someone else before the schedule ran out.
    pub stopped_early: bool,
}

/// The staging loop. Runs on the calling thread until the schedule is exhausted,
/// end-of-data is raised, or the stager fails.
pub fn serve_kernels<T: KernelStager>(
    coordinator: &HandshakeCoordinator<T::Kernel>,
    stager: &mut T,
    schedule: &[SpectralWindow],
) -> Result<StagingReport, CollaboratorError> {
    let mut report = StagingReport::default();

    for window in schedule {
        if coordinator.is_end_of_data() {
            report.stopped_early = true;
            break;
        }

        match stager.prepare(window) {
            Ok(Some(kernels)) => {
                coordinator.install_staged_kernel(kernels);
                report.sets_published += 1;
            }
            Ok(None) => report.sets_reused += 1,
            Err(e) => {
                error!("CF staging failed for SPW {}: {e}", window.id);
                coordinator.set_end_of_data(true);
                coordinator.signal_kernel_ready();
                return Err(e);
            }
        }
        coordinator.signal_kernel_ready();
        report.chunks_served += 1;

        coordinator.wait_for_kernel_consumed();
    }

    coordinator.set_end_of_data(true);
    coordinator.signal_kernel_ready();
    debug!(
        "CF server done: {} chunks served, {} kernel sets published.",
        report.chunks_served, report.sets_published
    );
    Ok(report)
}

/// A running CF server thread.
pub struct StagingHandle {
    handle: JoinHandle<Result<StagingReport, CollaboratorError>>,
}

impl StagingHandle {
    pub fn join(self) -> Result<StagingReport, PassError> {
        self.handle
            .join()
            .map_err(|_| PassError::Staging("CF server thread panicked.".to_string()))?
            .map_err(|e| PassError::Staging(e.to_string()))
    }
}

/// Starts the CF server on its own named thread.
pub fn spawn_cf_server<T>(
    coordinator: Arc<HandshakeCoordinator<T::Kernel>>,
    mut stager: T,
    schedule: Vec<SpectralWindow>,
) -> io::Result<StagingHandle>
where
    T: KernelStager + 'static,
{
    let handle = thread::Builder::new()
        .name("cf-server".to_string())
        .spawn(move || {
            // Releases the driver even if the stager panics.
            let _release = ScopeGuard::new(|| {
                coordinator.set_end_of_data(true);
                coordinator.signal_kernel_ready();
            });
            serve_kernels(coordinator.as_ref(), &mut stager, &schedule)
        })?;
    Ok(StagingHandle { handle })
}

/// Driver-side half of the protocol.
///
/// "Consumed" is raised once per chunk, after its first row-buffer has been gridded,
/// which is what lets the staging thread work one chunk ahead. A chunk without
/// row-buffers raises it when the chunk finishes.
pub struct OverlapHooks<K> {
    coordinator: Arc<HandshakeCoordinator<K>>,
}

impl<K> OverlapHooks<K> {
    pub fn new(coordinator: Arc<HandshakeCoordinator<K>>) -> Self {
        Self { coordinator }
    }
}

impl<K> PassHooks<K> for OverlapHooks<K> {
    fn wait_for_kernel_ready(&mut self) -> KernelGate<K> {
        if self.coordinator.wait_for_kernel_ready_or_end_of_data() {
            KernelGate::EndOfData
        } else {
            KernelGate::Proceed(self.coordinator.take_fresh_kernel())
        }
    }

    fn row_buffer_gridded(&mut self, index_in_chunk: usize) {
        if index_in_chunk == 0 {
            self.coordinator.signal_kernel_consumed();
        }
    }

    fn chunk_finished(&mut self, row_buffers_in_chunk: usize) {
        if row_buffers_in_chunk == 0 {
            self.coordinator.signal_kernel_consumed();
        }
    }
}

/// A guard that runs a closure when it goes out of scope. Each role holds one that
/// releases the other role however it leaves the pass, including by unwinding.
pub struct ScopeGuard<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    #[inline(always)]
    pub fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    #[inline(always)]
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

/// Maps every chunk of `source` to the spectral window it observes.
pub fn chunk_schedule<S: VisibilitySource + ?Sized>(
    source: &S,
    windows: &[SpectralWindow],
) -> Result<Vec<SpectralWindow>, PassError> {
    source
        .chunk_spectral_windows()
        .into_iter()
        .map(|id| {
            windows.iter().find(|w| w.id == id).copied().ok_or_else(|| {
                PassError::Staging(format!(
                    "data contains SPW {id}, which is not among the selected spectral windows"
                ))
            })
        })
        .collect()
}

/// Runs one pass with kernel staging overlapped on a CF server thread.
///
/// The driver's error, if any, takes precedence over the staging thread's.
pub fn run_overlapped_pass<P, S, E, T>(
    driver: &mut IterationDriver<P>,
    source: &mut S,
    engine: &mut E,
    stager: T,
    windows: &[SpectralWindow],
) -> Result<(PassSummary, StagingReport), PassError>
where
    P: PassProgressObserver,
    S: VisibilitySource + ?Sized,
    E: GriddingEngine,
    T: KernelStager<Kernel = E::Kernel> + 'static,
{
    let schedule = chunk_schedule(&*source, windows)?;
    let coordinator = Arc::new(HandshakeCoordinator::new());
    let server = spawn_cf_server(Arc::clone(&coordinator), stager, schedule)
        .map_err(|e| PassError::Staging(format!("could not start the CF server: {e}")))?;

    let pass = {
        let _shutdown = ScopeGuard::new(|| {
            coordinator.set_end_of_data(true);
            coordinator.signal_kernel_consumed();
        });
        let mut hooks = OverlapHooks::new(Arc::clone(&coordinator));
        driver.run_pass(source, engine, &mut hooks)
    };

    let staged = server.join();
    let summary = pass?;
    let report = staged?;
    info!(
        "Overlapped pass: {} kernel sets published, {} chunks reused the current set.",
        report.sets_published, report.sets_reused
    );
    Ok((summary, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Publishes the window id as the "kernel set", failing on request.
    struct IdStager {
        calls: Arc<AtomicUsize>,
        fail_on: Option<u32>,
    }

    impl KernelStager for IdStager {
        type Kernel = u32;

        fn prepare(
            &mut self,
            window: &SpectralWindow,
        ) -> Result<Option<StagedKernel<u32>>, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(window.id) {
                return Err(format!("no antenna response for SPW {}", window.id).into());
            }
            Ok(Some(Arc::new(window.id)))
        }
    }

    fn schedule(ids: &[u32]) -> Vec<SpectralWindow> {
        ids.iter()
            .map(|&id| SpectralWindow {
                id,
                ref_freq_hz: 1.0e9 + f64::from(id),
            })
            .collect()
    }

    #[test]
    fn server_walks_the_schedule_one_chunk_ahead() {
        let coordinator = Arc::new(HandshakeCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let stager = IdStager {
            calls: Arc::clone(&calls),
            fail_on: None,
        };
        let server = spawn_cf_server(Arc::clone(&coordinator), stager, schedule(&[4, 5, 6])).unwrap();

        let mut hooks = OverlapHooks::new(Arc::clone(&coordinator));
        let mut seen = Vec::new();
        loop {
            match hooks.wait_for_kernel_ready() {
                KernelGate::EndOfData => break,
                KernelGate::Proceed(kernels) => {
                    seen.push(kernels.map(|k| *k));
                    hooks.row_buffer_gridded(0);
                    hooks.row_buffer_gridded(1);
                    hooks.chunk_finished(2);
                }
            }
        }

        let report = server.join().unwrap();
        assert_eq!(seen, vec![Some(4), Some(5), Some(6)]);
        assert_eq!(report.chunks_served, 3);
        assert_eq!(report.sets_published, 3);
        assert!(!report.stopped_early);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn end_of_data_from_the_driver_stops_the_server() {
        let coordinator = Arc::new(HandshakeCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let stager = IdStager {
            calls: Arc::clone(&calls),
            fail_on: None,
        };
        let server =
            spawn_cf_server(Arc::clone(&coordinator), stager, schedule(&[1, 2, 3, 4])).unwrap();

        let mut hooks = OverlapHooks::new(Arc::clone(&coordinator));
        assert!(matches!(hooks.wait_for_kernel_ready(), KernelGate::Proceed(Some(_))));
        {
            let _shutdown = ScopeGuard::new(|| {
                coordinator.set_end_of_data(true);
                coordinator.signal_kernel_consumed();
            });
        }

        let report = server.join().unwrap();
        assert!(report.stopped_early);
        assert!(report.chunks_served <= 2);
    }

    #[test]
    fn stager_failure_releases_the_driver_and_surfaces_on_join() {
        let coordinator = Arc::new(HandshakeCoordinator::new());
        let stager = IdStager {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on: Some(2),
        };
        let server = spawn_cf_server(Arc::clone(&coordinator), stager, schedule(&[1, 2, 3])).unwrap();

        let mut hooks = OverlapHooks::new(Arc::clone(&coordinator));
        assert!(matches!(hooks.wait_for_kernel_ready(), KernelGate::Proceed(Some(_))));
        hooks.row_buffer_gridded(0);
        assert!(matches!(hooks.wait_for_kernel_ready(), KernelGate::EndOfData));

        let err = server.join().unwrap_err();
        assert!(matches!(err, PassError::Staging(_)));
        assert!(err.to_string().contains("no antenna response for SPW 2"));
    }

    #[test]
    fn empty_schedule_raises_end_of_data_immediately() {
        let coordinator = HandshakeCoordinator::<u32>::new();
        let mut stager = IdStager {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
        };
        let report = serve_kernels(&coordinator, &mut stager, &[]).unwrap();
        assert_eq!(report, StagingReport::default());
        assert!(coordinator.is_end_of_data());
    }

    #[test]
    fn empty_chunks_still_release_the_server() {
        let coordinator = Arc::new(HandshakeCoordinator::new());
        let stager = IdStager {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
        };
        let server = spawn_cf_server(Arc::clone(&coordinator), stager, schedule(&[8, 9])).unwrap();

        let mut hooks = OverlapHooks::new(Arc::clone(&coordinator));
        for _ in 0..2 {
            assert!(matches!(hooks.wait_for_kernel_ready(), KernelGate::Proceed(_)));
            hooks.chunk_finished(0);
        }
        assert!(matches!(hooks.wait_for_kernel_ready(), KernelGate::EndOfData));
        assert_eq!(server.join().unwrap().chunks_served, 2);
    }

    #[test]
    fn scope_guard_runs_exactly_once() {
        let runs = AtomicUsize::new(0);
        {
            let _guard = ScopeGuard::new(|| {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}

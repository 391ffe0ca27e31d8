use log::{Level, LevelFilter, Log, Metadata, Record};
use roadrunner::driver::{IterationDriver, PassSettings};
use roadrunner::engine::{CpuGridder, KernelCache};
use roadrunner::progress::NoopPassProgress;
use roadrunner::source::{ObservationLayout, synthetic_observation};
use roadrunner::staging::run_overlapped_pass;
use roadrunner::types::{ImagingMode, SpectralWindow, Visibility};
use std::sync::Mutex;

/// Keeps every warning logged during the test.
struct CaptureLogger {
    warnings: Mutex<Vec<String>>,
}

impl Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if record.level() == Level::Warn {
            self.warnings
                .lock()
                .unwrap()
                .push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger {
    warnings: Mutex::new(Vec::new()),
};

#[test]
fn missing_corrected_column_falls_back_with_exactly_one_warning() {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(LevelFilter::Warn);

    let windows = vec![SpectralWindow {
        id: 0,
        ref_freq_hz: 1.4e9,
    }];
    let layout = ObservationLayout {
        row_buffers_per_chunk: vec![4, 2, 3],
        rows_per_row_buffer: 8,
        with_corrected: false,
        ..Default::default()
    };
    let mut source = synthetic_observation(&layout, &windows);
    let mut engine = CpuGridder::new(64, 8.0);
    let mut driver = IterationDriver::new(
        PassSettings {
            mode: ImagingMode::Residual,
            column: None,
            is_root: true,
        },
        NoopPassProgress,
    );

    let (summary, _) = run_overlapped_pass(
        &mut driver,
        &mut source,
        &mut engine,
        KernelCache::new(&windows, 2, false),
        &windows,
    )
    .unwrap();

    assert_eq!(summary.row_buffers, 9);
    assert_eq!(summary.rows, 72);
    assert!(engine.grid().iter().any(|v| *v != Visibility::ZERO));

    let warnings = LOGGER.warnings.lock().unwrap();
    let fallbacks = warnings
        .iter()
        .filter(|w| w.contains("CORRECTED_DATA"))
        .count();
    assert_eq!(fallbacks, 1, "warnings: {warnings:?}");
}

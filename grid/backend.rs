// ========================================================================================
//
//                     COMPUTE BACKEND BRING-UP AND TEARDOWN
//
// ========================================================================================
//
// Gridding cannot start until the compute backends it runs on are up. Bring-up is a
// process-lifetime event: it happens once, on the first request, no matter how many call
// sites or threads ask for it, and teardown happens once, from a process-exit hook.
//
// Backends are described by a data-driven capability table. Each entry says whether the
// backend was compiled in and carries the closures that initialize and finalize it, so a
// new backend is a new table entry and not a new code path.

use ahash::{AHashMap, AHashSet};
use log::{debug, error, info, warn};
use std::env;
use std::fmt;
use std::path::Path;
use std::sync::{Once, OnceLock};
use thiserror::Error;

/// Selects the backend combination. Takes precedence over [`LEGACY_BACKEND_ENV`].
pub const BACKEND_ENV: &str = "RR_BACKEND";
/// The historical selector name, honoured when [`BACKEND_ENV`] is unset.
pub const LEGACY_BACKEND_ENV: &str = "HPGDEVICE";
/// Sizes the host-parallel thread pool.
pub const NPROCS_ENV: &str = "RR_NPROCS";
/// The backend selected when no selector is given.
pub const DEFAULT_BACKEND: Backend = Backend::Cuda;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Backend {
    Cuda,
    Hip,
    OpenMp,
    Serial,
}

impl Backend {
    pub const ALL: [Backend; 4] = [Backend::Cuda, Backend::Hip, Backend::OpenMp, Backend::Serial];

    pub fn name(self) -> &'static str {
        match self {
            Backend::Cuda => "cuda",
            Backend::Hip => "hip",
            Backend::OpenMp => "openmp",
            Backend::Serial => "serial",
        }
    }

    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Backend::Cuda => &["gpu", "nvidia"],
            Backend::Hip => &["rocm", "amd"],
            Backend::OpenMp => &["omp", "threads", "host"],
            Backend::Serial => &["cpu", "sequential"],
        }
    }

    /// Whether the backend runs on an accelerator rather than the host.
    pub fn is_device(self) -> bool {
        matches!(self, Backend::Cuda | Backend::Hip)
    }

    /// Resolves a canonical name or an alias, ignoring case and surrounding whitespace.
    pub fn from_name(value: &str) -> Option<Backend> {
        let wanted = value.trim().to_ascii_lowercase();
        Backend::ALL
            .into_iter()
            .find(|b| b.name() == wanted || b.aliases().contains(&wanted.as_str()))
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{variable}='{value}' does not name a supported backend. Accepted names: {accepted}")]
    UnknownBackend {
        variable: &'static str,
        value: String,
        accepted: String,
    },
    #[error("{variable}='{value}' is not a positive thread count")]
    InvalidThreadCount { variable: &'static str, value: String },
}

fn accepted_backend_names() -> String {
    Backend::ALL
        .iter()
        .map(|b| format!("{} (aliases: {})", b.name(), b.aliases().join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parses a backend selector value. An empty or absent value selects [`DEFAULT_BACKEND`].
pub fn parse_backend_selector(
    variable: &'static str,
    value: Option<&str>,
) -> Result<Backend, BackendError> {
    match value.map(str::trim) {
        None | Some("") => Ok(DEFAULT_BACKEND),
        Some(v) => Backend::from_name(v).ok_or_else(|| BackendError::UnknownBackend {
            variable,
            value: v.to_string(),
            accepted: accepted_backend_names(),
        }),
    }
}

/// Reads the backend selector from the environment.
pub fn backend_from_env() -> Result<Backend, BackendError> {
    if let Ok(value) = env::var(BACKEND_ENV) {
        return parse_backend_selector(BACKEND_ENV, Some(&value));
    }
    let legacy = env::var(LEGACY_BACKEND_ENV).ok();
    parse_backend_selector(LEGACY_BACKEND_ENV, legacy.as_deref())
}

/// The ordered request list for a selected backend: the host-parallel backend always
/// comes first, followed by the selection unless it is the host-parallel backend itself.
pub fn request_list_for(selected: Backend) -> Vec<Backend> {
    let mut requested = vec![Backend::OpenMp];
    if selected != Backend::OpenMp {
        requested.push(selected);
    }
    requested
}

/// Parses the host-parallel thread count. An empty or absent value means "all cores".
pub fn parse_thread_count(value: Option<&str>) -> Result<usize, BackendError> {
    match value.map(str::trim) {
        None | Some("") => Ok(num_cpus::get().max(1)),
        Some(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(BackendError::InvalidThreadCount {
                variable: NPROCS_ENV,
                value: v.to_string(),
            }),
        },
    }
}

// ========================================================================================
//                                   Capability table
// ========================================================================================

type AvailableFn = Box<dyn Fn() -> bool + Send + Sync>;
type InitFn = Box<dyn Fn() -> Result<(), String> + Send + Sync>;
type FinalizeFn = Box<dyn Fn() + Send + Sync>;

/// How to bring one backend up and down.
pub struct BackendCapability {
    available: AvailableFn,
    init: InitFn,
    finalize: FinalizeFn,
}

impl BackendCapability {
    pub fn new(
        available: impl Fn() -> bool + Send + Sync + 'static,
        init: impl Fn() -> Result<(), String> + Send + Sync + 'static,
        finalize: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            available: Box::new(available),
            init: Box::new(init),
            finalize: Box::new(finalize),
        }
    }
}

/// Maps each backend to its capability. Backends without an entry are unsupported.
#[derive(Default)]
pub struct CapabilityTable {
    entries: AHashMap<Backend, BackendCapability>,
}

impl CapabilityTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds or replaces the entry for `backend`.
    pub fn with(mut self, backend: Backend, capability: BackendCapability) -> Self {
        self.entries.insert(backend, capability);
        self
    }

    /// The table for this host: a rayon pool for the host-parallel backend, a no-op
    /// serial backend, and device probes for the accelerators compiled into this build.
    pub fn host() -> Self {
        Self::empty()
            .with(
                Backend::OpenMp,
                BackendCapability::new(|| true, init_host_pool, || {
                    debug!("Host-parallel backend released.")
                }),
            )
            .with(
                Backend::Serial,
                BackendCapability::new(|| true, || Ok(()), || {}),
            )
            .with(
                Backend::Cuda,
                BackendCapability::new(
                    || cfg!(feature = "cuda"),
                    || probe_device("CUDA_VISIBLE_DEVICES", &["/dev/nvidiactl", "/proc/driver/nvidia/version"]),
                    || debug!("CUDA backend released."),
                ),
            )
            .with(
                Backend::Hip,
                BackendCapability::new(
                    || cfg!(feature = "hip"),
                    || probe_device("HIP_VISIBLE_DEVICES", &["/dev/kfd"]),
                    || debug!("HIP backend released."),
                ),
            )
    }

    fn get(&self, backend: Backend) -> Option<&BackendCapability> {
        self.entries.get(&backend)
    }
}

fn init_host_pool() -> Result<(), String> {
    let threads = parse_thread_count(env::var(NPROCS_ENV).ok().as_deref())
        .map_err(|e| e.to_string())?;
    match rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
    {
        Ok(()) => {
            debug!("Host-parallel pool started with {threads} threads.");
            Ok(())
        }
        // Someone already built the global pool; it is just as usable.
        Err(e) => {
            debug!("Host-parallel pool already running: {e}");
            Ok(())
        }
    }
}

fn probe_device(visibility_var: &str, nodes: &[&str]) -> Result<(), String> {
    if let Ok(visible) = env::var(visibility_var) {
        let visible = visible.trim();
        if visible.is_empty() || visible == "-1" {
            return Err(format!("no devices visible ({visibility_var}='{visible}')"));
        }
    }
    if nodes.iter().any(|node| Path::new(node).exists()) {
        Ok(())
    } else {
        Err(format!("no device node found (looked for {})", nodes.join(", ")))
    }
}

// ========================================================================================
//                                   The lifecycle itself
// ========================================================================================

/// What came up, reported against one particular request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInitResult {
    pub requested: Vec<Backend>,
    /// Backends that initialized, in request order.
    pub initialized: Vec<Backend>,
    /// Whether the gridder library layered over the backends came up.
    pub gridder_ready: bool,
}

impl BackendInitResult {
    /// Order-sensitive: the initialized list must equal the requested list element for element.
    pub fn success(&self) -> bool {
        self.initialized == self.requested
    }

    pub fn ready_for_gridding(&self) -> bool {
        self.success() && self.gridder_ready
    }

    /// Requested backends that did not come up.
    pub fn failed(&self) -> Vec<Backend> {
        self.requested
            .iter()
            .copied()
            .filter(|b| !self.initialized.contains(b))
            .collect()
    }
}

struct InitOutcome {
    initialized: Vec<Backend>,
    gridder_ready: bool,
}

/// Owns the one-time bring-up of a set of backends and their at-most-once teardown.
pub struct BackendLifecycle {
    table: CapabilityTable,
    outcome: OnceLock<InitOutcome>,
    finalized: Once,
}

impl BackendLifecycle {
    pub fn new(table: CapabilityTable) -> Self {
        Self {
            table,
            outcome: OnceLock::new(),
            finalized: Once::new(),
        }
    }

    /// Brings the backends up on the first call; every other call, concurrent or later,
    /// waits for that bring-up and reports its result against its own request.
    pub fn request_backends(&self, requested: &[Backend]) -> BackendInitResult {
        let outcome = self.outcome.get_or_init(|| self.initialize(requested));
        let result = BackendInitResult {
            requested: requested.to_vec(),
            initialized: outcome.initialized.clone(),
            gridder_ready: outcome.gridder_ready,
        };
        if !result.success() {
            error!(
                "Backend initialization incomplete. Requested [{}], initialized [{}], failed [{}].",
                join_names(&result.requested),
                join_names(&result.initialized),
                join_names(&result.failed())
            );
        }
        result
    }

    pub fn is_backend_initialized(&self, backend: Backend) -> bool {
        self.outcome
            .get()
            .is_some_and(|o| o.initialized.contains(&backend))
    }

    /// Tears down whatever came up, in reverse order. Runs at most once and is a no-op
    /// when nothing was ever initialized.
    pub fn finalize(&self) {
        self.finalized.call_once(|| {
            let Some(outcome) = self.outcome.get() else {
                debug!("Backend finalizer ran before any backend was requested.");
                return;
            };
            for backend in outcome.initialized.iter().rev() {
                if let Some(capability) = self.table.get(*backend) {
                    (capability.finalize)();
                }
            }
            info!("Finalized backends [{}].", join_names(&outcome.initialized));
        });
    }

    fn initialize(&self, requested: &[Backend]) -> InitOutcome {
        let mut initialized = Vec::with_capacity(requested.len());
        let mut attempted = AHashSet::with_capacity(requested.len());
        for &backend in requested {
            // Each backend is brought up at most once, whether or not that worked.
            if !attempted.insert(backend) {
                if initialized.contains(&backend) {
                    initialized.push(backend);
                }
                continue;
            }
            let Some(capability) = self.table.get(backend) else {
                error!("Backend '{backend}' has no entry in the capability table.");
                continue;
            };
            if !(capability.available)() {
                error!("Backend '{backend}' was not compiled into this build.");
                continue;
            }
            match (capability.init)() {
                Ok(()) => {
                    debug!("Backend '{backend}' initialized.");
                    initialized.push(backend);
                }
                Err(e) => error!("Backend '{backend}' failed to initialize: {e}"),
            }
        }

        // The gridder library drives the primary (last requested) backend.
        let gridder_ready = requested
            .last()
            .is_some_and(|primary| initialized.contains(primary));
        if gridder_ready {
            info!("Backends initialized: [{}].", join_names(&initialized));
        } else {
            warn!("Gridder library unavailable: primary backend did not come up.");
        }
        InitOutcome {
            initialized,
            gridder_ready,
        }
    }
}

fn join_names(backends: &[Backend]) -> String {
    backends
        .iter()
        .map(|b| b.name())
        .collect::<Vec<_>>()
        .join(", ")
}

// ========================================================================================
//                                 Process-wide entry points
// ========================================================================================

static LIFECYCLE: OnceLock<BackendLifecycle> = OnceLock::new();
static EXIT_HOOK: Once = Once::new();

extern "C" fn finalize_at_exit() {
    if let Some(lifecycle) = LIFECYCLE.get() {
        lifecycle.finalize();
    }
}

fn register_exit_hook() {
    // SAFETY: `finalize_at_exit` is a plain `extern "C"` function with no arguments that
    // only touches process-wide statics, which remain valid during exit handlers.
    let rc = unsafe { libc::atexit(finalize_at_exit) };
    if rc != 0 {
        warn!("Could not register the backend finalizer (atexit returned {rc}).");
    }
}

/// Brings up the process-wide backends. See [`BackendLifecycle::request_backends`].
///
/// The first call also registers the process-exit finalizer.
pub fn request_backends(requested: &[Backend]) -> BackendInitResult {
    let lifecycle = LIFECYCLE.get_or_init(|| BackendLifecycle::new(CapabilityTable::host()));
    EXIT_HOOK.call_once(register_exit_hook);
    lifecycle.request_backends(requested)
}

/// Whether `backend` came up in this process. False before the first request.
pub fn is_backend_initialized(backend: Backend) -> bool {
    LIFECYCLE
        .get()
        .is_some_and(|lifecycle| lifecycle.is_backend_initialized(backend))
}

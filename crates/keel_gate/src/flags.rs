//! Gateway tunables, read from the environment at op construction.

/// Default per-request row cap applied to scan sub-requests.
pub const DEFAULT_PREFETCH_LIMIT: u64 = 1024;
/// Backward scans are slower, so their prefetch is scaled down by default.
pub const DEFAULT_BACKWARD_PREFETCH_SCALE_FACTOR: f64 = 0.0625;
/// Ceiling on concurrent live sub-requests per read op.
pub const DEFAULT_REQUEST_LIMIT: usize = 1024;

fn configured_prefetch_limit() -> u64 {
    std::env::var("KEEL_GATE_PREFETCH_LIMIT")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_PREFETCH_LIMIT)
}

fn configured_backward_prefetch_scale_factor() -> f64 {
    std::env::var("KEEL_GATE_BACKWARD_PREFETCH_SCALE_FACTOR")
        .ok()
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| *value > 0.0 && *value <= 1.0)
        .unwrap_or(DEFAULT_BACKWARD_PREFETCH_SCALE_FACTOR)
}

fn configured_request_limit() -> usize {
    std::env::var("KEEL_GATE_REQUEST_LIMIT")
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_REQUEST_LIMIT)
}

/// Snapshot of the gateway tunables, taken once per op so a statement sees a
/// consistent configuration across its round trips.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecFlags {
    pub prefetch_limit: u64,
    pub backward_prefetch_scale_factor: f64,
    pub request_limit: usize,
}

impl Default for ExecFlags {
    fn default() -> Self {
        ExecFlags {
            prefetch_limit: DEFAULT_PREFETCH_LIMIT,
            backward_prefetch_scale_factor: DEFAULT_BACKWARD_PREFETCH_SCALE_FACTOR,
            request_limit: DEFAULT_REQUEST_LIMIT,
        }
    }
}

impl ExecFlags {
    pub fn from_env() -> ExecFlags {
        ExecFlags {
            prefetch_limit: configured_prefetch_limit(),
            backward_prefetch_scale_factor: configured_backward_prefetch_scale_factor(),
            request_limit: configured_request_limit(),
        }
    }
}

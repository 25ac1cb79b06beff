//! Statistics sampling for adaptive process limits.
//!
//! Every sampling interval the running process count of each service is
//! smoothed into a moving average. Services with distinct peak/average
//! limits drift from idle mode (peak concurrency allowed) toward stress
//! mode (long-term average) as the smoothed load approaches the average.

/// Sampling interval in seconds.
pub const SAMPLE_SECS: u64 = 60;
/// Moving-average smoothing factor.
const NSAMPLE: f64 = 5.0;

/// Mutable per-service sampling state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleState {
    /// Smoothed process count.
    pub total_proc_avg: f64,
    /// Effective process limit after modulation.
    pub max_proc: usize,
}

/// One sampling step for one service.
///
/// `peak == average` keeps a static limit. The caller guarantees
/// `peak >= average` (validated at configuration load).
pub fn sample_service(state: &mut SampleState, total_proc: usize, peak: usize, average: usize) {
    if peak == average {
        state.max_proc = peak;
        return;
    }
    #[allow(clippy::cast_precision_loss)]
    {
        state.total_proc_avg += (total_proc as f64 - state.total_proc_avg) / NSAMPLE;
    }
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    if state.total_proc_avg >= average as f64 {
        state.max_proc = average;
    } else {
        let decay = state.total_proc_avg * ((peak - average) as f64) / (average as f64);
        state.max_proc = (peak - decay.round() as usize).clamp(average, peak);
    }
}

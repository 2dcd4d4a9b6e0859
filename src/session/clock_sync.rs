use tracing::{debug, trace};
use crate::config::TimeSyncConfig;

/// The client's estimate of the server's clock.
///
/// The estimate is kept as an offset to the client's local clock, so it advances with the local
///  clock between sync rounds. Each round yields a new estimate `server_time + rtt / 2`:
///  * if there is no estimate yet, or the new one is off by more than the hard reset threshold,
///    the estimate jumps to the new value
///  * differences below the minimum correction are ignored as jitter
///  * otherwise the estimate moves towards the new value, by at most the maximum correction
///
/// Gradual adjustment keeps the estimated server time from jumping back and forth with network
///  jitter, which would be visible e.g. in the playback of timed messages.
pub struct ClockSync {
    hard_reset_threshold: f64,
    min_correction: f64,
    max_correction: f64,
    offset: Option<f64>,
}

impl ClockSync {
    pub fn new(config: &TimeSyncConfig) -> ClockSync {
        ClockSync {
            hard_reset_threshold: config.hard_reset_threshold.as_secs_f64(),
            min_correction: config.min_correction.as_secs_f64(),
            max_correction: config.max_correction.as_secs_f64(),
            offset: None,
        }
    }

    pub fn server_time_estimate(&self, local_time: f64) -> Option<f64> {
        self.offset.map(|offset| local_time + offset)
    }

    pub fn reset(&mut self) {
        self.offset = None;
    }

    /// Processes the server's response to a sync request. `client_send_time` is the client's
    ///  local time when the request was sent, echoed by the server.
    pub fn on_response(&mut self, client_send_time: f64, server_time: f64, local_time: f64) {
        let rtt = local_time - client_send_time;
        if rtt < 0.0 {
            debug!("time sync response with negative round trip time - ignoring");
            return;
        }
        let new_estimate = server_time + rtt / 2.0;

        let offset = match self.offset {
            None => {
                debug!("initial server time estimate: {:.4}", new_estimate);
                new_estimate - local_time
            }
            Some(offset) => {
                let delta = new_estimate - (local_time + offset);
                if delta.abs() > self.hard_reset_threshold {
                    debug!("server time estimate is off by {:.4}s - resetting", delta);
                    new_estimate - local_time
                }
                else if delta.abs() <= self.min_correction {
                    trace!("server time estimate is off by {:.6}s - no correction", delta);
                    offset
                }
                else {
                    let correction = delta.signum() * delta.abs().min(self.max_correction);
                    trace!("correcting server time estimate by {:.6}s", correction);
                    offset + correction
                }
            }
        };
        self.offset = Some(offset);
    }
}

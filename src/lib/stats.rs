use serde::Serialize;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::manager::SharedSessions;
use crate::radar::RadarError;
use crate::radar::legend::ColorLookup;
use crate::radar::spoke::now_millis;
use crate::radar::sweep::SweepBuffer;
use crate::util::PrintableSpoke;

/// What the current sweep looks like to somebody watching the screen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepCoverage {
    pub rows_with_data: usize,
    pub stale_rows: usize,
    pub visible_pixels: usize,
    pub strongest_row: Option<usize>,
}

impl SweepCoverage {
    ///
    /// Scan a snapshot of the sweep. A pixel is visible when its color is
    /// not transparent; a row is stale when it was written longer than
    /// `stale_after` ago. `scratch` is reused between calls.
    ///
    pub fn measure(
        sweep: &SweepBuffer,
        lut: &ColorLookup,
        stale_after: Duration,
        scratch: &mut Vec<u8>,
    ) -> SweepCoverage {
        sweep.snapshot_into(scratch);

        let now = now_millis();
        let mut coverage = SweepCoverage::default();
        let mut strongest = 0;

        for (angle, row) in scratch
            .chunks_exact(sweep.max_spoke_len().max(1))
            .enumerate()
        {
            let visible = row.iter().filter(|p| lut.lookup(**p).a > 0).count();
            if visible > 0 {
                coverage.rows_with_data += 1;
                coverage.visible_pixels += visible;
                if visible > strongest {
                    strongest = visible;
                    coverage.strongest_row = Some(angle);
                }
            }
            if let Some(age) = sweep.row_age(angle as u32, now) {
                if age > stale_after {
                    coverage.stale_rows += 1;
                }
            }
        }
        coverage
    }
}

///
/// Logs the counters of every session at a fixed interval.
///
pub struct Reporter {
    sessions: SharedSessions,
    lut: ColorLookup,
    interval: Duration,
    stale_after: Duration,
    scratch: Vec<u8>,
}

impl Reporter {
    pub fn new(sessions: SharedSessions, lut: ColorLookup, interval: Duration) -> Self {
        Reporter {
            sessions,
            lut,
            interval,
            stale_after: interval.max(Duration::from_secs(1)) * 2,
            scratch: Vec::new(),
        }
    }

    async fn report(&mut self) {
        let sessions = self.sessions.all();
        if sessions.is_empty() {
            log::info!("No radars");
            return;
        }

        for session in sessions {
            let stats = session.statistics().await;
            let sweep = session.sweep();
            let coverage =
                SweepCoverage::measure(&sweep, &self.lut, self.stale_after, &mut self.scratch);

            let (state, spokes, bytes, errors) = match &stats.receiver {
                Some(r) => (
                    r.state.to_string(),
                    r.spokes_received,
                    r.bytes_received,
                    r.decode_errors,
                ),
                None => ("Stopped".to_owned(), 0, 0, 0),
            };
            log::info!(
                "{}: {} at {} m, stream {} {} spokes {} bytes {} errors, sweep {} rows written {} with echoes {} stale",
                stats.id,
                stats.status,
                stats.range_meters,
                state,
                spokes,
                bytes,
                errors,
                stats.rows_written,
                coverage.rows_with_data,
                coverage.stale_rows
            );

            if let Some(angle) = coverage.strongest_row {
                if let Some(row) = sweep.read_row(angle as u32) {
                    log::debug!(
                        "{}: strongest spoke {} {}",
                        stats.id,
                        angle,
                        PrintableSpoke::new(&row.data[..row.info.length]).with_columns(64)
                    );
                }
            }
            if let Ok(json) = serde_json::to_string(&stats) {
                log::trace!("{}: {}", stats.id, json);
            }
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), RadarError> {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick is immediate, there is nothing to report yet
        ticker.tick().await;

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    break;
                },
                _ = ticker.tick() => {
                    self.report().await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radar::legend::{ColorScheme, Thresholds};

    #[test]
    fn coverage_of_a_sweep() {
        let sweep = SweepBuffer::new(8, 4);
        let lut = ColorLookup::build(ColorScheme::Day, Thresholds::default());
        let mut scratch = Vec::new();

        let empty = SweepCoverage::measure(&sweep, &lut, Duration::from_secs(10), &mut scratch);
        assert_eq!(empty, SweepCoverage::default());

        sweep.write_spoke(1, &[0, 10, 0, 0], 100);
        sweep.write_spoke(5, &[200, 200, 1], 100);
        sweep.write_spoke(6, &[0, 0], 100);

        let coverage = SweepCoverage::measure(&sweep, &lut, Duration::from_secs(10), &mut scratch);
        assert_eq!(coverage.rows_with_data, 2);
        assert_eq!(coverage.visible_pixels, 4);
        assert_eq!(coverage.strongest_row, Some(5));
        assert_eq!(coverage.stale_rows, 0);
        assert_eq!(scratch.len(), 32);
    }
}

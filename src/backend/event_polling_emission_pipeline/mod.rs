pub(crate) mod job_events;

use std::time::Duration;

pub(crate) fn poll_sleep_interval() -> Duration {
    Duration::from_millis(100)
}

use biometrics::{Collector, Counter, Moments};

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("eddie.client.requests");
pub(crate) static CLIENT_REQUEST_ERRORS: Counter = Counter::new("eddie.client.request_errors");
pub(crate) static CLIENT_REQUEST_RETRIES: Counter = Counter::new("eddie.client.retries");
pub(crate) static CLIENT_REQUEST_DURATION: Moments =
    Moments::new("eddie.client.request_duration_seconds");
pub(crate) static CLIENT_RETRY_BACKOFF: Moments = Moments::new("eddie.client.retry_backoff_seconds");

pub(crate) static STREAM_EVENTS: Counter = Counter::new("eddie.stream.events");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("eddie.stream.errors");
pub(crate) static STREAM_BYTES: Counter = Counter::new("eddie.stream.bytes");

pub(crate) static SESSION_TURNS: Counter = Counter::new("eddie.session.turns");
pub(crate) static SESSION_TURN_ERRORS: Counter = Counter::new("eddie.session.turn_errors");
pub(crate) static SESSION_TURN_DURATION: Moments =
    Moments::new("eddie.session.turn_duration_seconds");
pub(crate) static SESSION_TOOL_CALLS: Counter = Counter::new("eddie.session.tool_calls");
pub(crate) static SESSION_TOOL_ERRORS: Counter = Counter::new("eddie.session.tool_errors");

pub(crate) static MEMORY_WRITES: Counter = Counter::new("eddie.memory.writes");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_REQUEST_ERRORS);
    collector.register_counter(&CLIENT_REQUEST_RETRIES);
    collector.register_moments(&CLIENT_REQUEST_DURATION);
    collector.register_moments(&CLIENT_RETRY_BACKOFF);

    collector.register_counter(&STREAM_EVENTS);
    collector.register_counter(&STREAM_ERRORS);
    collector.register_counter(&STREAM_BYTES);

    collector.register_counter(&SESSION_TURNS);
    collector.register_counter(&SESSION_TURN_ERRORS);
    collector.register_moments(&SESSION_TURN_DURATION);
    collector.register_counter(&SESSION_TOOL_CALLS);
    collector.register_counter(&SESSION_TOOL_ERRORS);

    collector.register_counter(&MEMORY_WRITES);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_every_sensor() {
        register_biometrics(Collector::new());
    }
}

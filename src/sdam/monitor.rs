use std::time::{Duration, Instant};

use super::{
    description::server::ServerDescription,
    topology::{CheckRequestReceiver, TopologyUpdater, TopologyWatcher},
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::{Error, Result},
    event::sdam::{
        SdamEventEmitter,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime::{self, stream},
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Weight of the newest sample in the round trip time average.
const RTT_WEIGHT: f64 = 0.2;

/// Folds a new round trip time sample into the running average. The first sample becomes the
/// average as-is.
pub(crate) fn weighted_average_rtt(previous: Option<Duration>, sample: Duration) -> Duration {
    match previous {
        Some(previous) => Duration::from_secs_f64(
            RTT_WEIGHT * sample.as_secs_f64() + (1.0 - RTT_WEIGHT) * previous.as_secs_f64(),
        ),
        None => sample,
    }
}

/// Periodically checks a single server with `hello` over a dedicated connection and reports what
/// it finds to the topology.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    connection_establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    check_requests: CheckRequestReceiver,
    sdam_event_emitter: SdamEventEmitter,
    average_round_trip_time: Option<Duration>,
    hello_ok: Option<bool>,
    heartbeat_frequency: Duration,
    check_timeout: Duration,
    next_connection_id: u32,
}

impl Monitor {
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        check_requests: CheckRequestReceiver,
        sdam_event_emitter: SdamEventEmitter,
        connection_establisher: ConnectionEstablisher,
        options: &ClientOptions,
    ) {
        let check_timeout = stream::connect_timeout(options.connect_timeout);

        let monitor = Self {
            address,
            connection: None,
            connection_establisher,
            topology_updater,
            topology_watcher,
            check_requests,
            sdam_event_emitter,
            average_round_trip_time: None,
            hello_ok: None,
            heartbeat_frequency: options
                .heartbeat_freq
                .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY),
            check_timeout,
            next_connection_id: 1,
        };
        runtime::execute(monitor.execute());
    }

    async fn execute(mut self) {
        let min_frequency = MIN_HEARTBEAT_FREQUENCY.min(self.heartbeat_frequency);

        loop {
            self.check_server().await;

            if !self.is_alive() {
                break;
            }

            // Anything requested while the check ran has been answered by it.
            self.check_requests.clear();

            runtime::delay_for(min_frequency).await;
            self.check_requests
                .wait(self.heartbeat_frequency.saturating_sub(min_frequency))
                .await;

            if !self.is_alive() {
                break;
            }
        }
    }

    /// Whether the topology is still open and still contains this server.
    fn is_alive(&self) -> bool {
        self.topology_watcher.is_alive()
            && self
                .topology_watcher
                .server_description(&self.address)
                .is_some()
    }

    /// Checks the server by running a `hello` command. A network error against a server that
    /// was previously available is retried once on a fresh connection before it is reported.
    ///
    /// Returns true if the topology changed.
    async fn check_server(&mut self) -> bool {
        let mut retried = false;
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                let previously_available = self
                    .topology_watcher
                    .server_description(&self.address)
                    .is_some_and(|sd| sd.is_available());
                if error.is_network_error() && previously_available {
                    self.handle_error(error).await;
                    retried = true;
                    self.perform_hello().await
                } else {
                    Err(error)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                let average_rtt = self.average_round_trip_time.unwrap_or_default();
                let description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    average_rtt,
                );
                self.topology_updater.update(description).await
            }
            Err(error) => self.handle_error(error).await || retried,
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        let driver_connection_id = self
            .connection
            .as_ref()
            .map(|conn| conn.id)
            .unwrap_or(self.next_connection_id);

        self.sdam_event_emitter.emit_event(|| {
            ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                driver_connection_id,
            }
            .into()
        });

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                let command = hello_command(self.hello_ok);
                runtime::timeout(self.check_timeout, run_hello(conn, command))
                    .await
                    .and_then(std::convert::identity)
            }
            None => {
                let id = self.next_connection_id;
                self.next_connection_id += 1;
                self.connection_establisher
                    .establish_monitoring_connection(self.address.clone(), id)
                    .await
                    .map(|(connection, reply)| {
                        self.connection = Some(connection);
                        reply
                    })
            }
        };
        let duration = start.elapsed();

        match result {
            Ok(ref reply) => {
                self.hello_ok = reply.command_response.hello_ok;
                self.average_round_trip_time =
                    Some(weighted_average_rtt(self.average_round_trip_time, duration));

                self.sdam_event_emitter.emit_event(|| {
                    ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply.raw_command_response.clone(),
                        server_address: self.address.clone(),
                        driver_connection_id,
                    }
                    .into()
                });
            }
            Err(ref error) => {
                self.connection = None;
                self.hello_ok = None;
                self.average_round_trip_time = None;

                self.sdam_event_emitter.emit_event(|| {
                    ServerHeartbeatFailedEvent {
                        duration,
                        failure: error.clone(),
                        server_address: self.address.clone(),
                        driver_connection_id,
                    }
                    .into()
                });
            }
        }

        result
    }

    async fn handle_error(&mut self, error: Error) -> bool {
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    use super::weighted_average_rtt;

    #[test]
    fn first_sample_seeds_average() {
        let sample = Duration::from_millis(37);
        assert_eq!(weighted_average_rtt(None, sample), sample);
    }

    #[test]
    fn later_samples_are_weighted() {
        let average = weighted_average_rtt(
            Some(Duration::from_millis(100)),
            Duration::from_millis(200),
        );
        assert_relative_eq!(average.as_secs_f64() * 1000.0, 120.0, epsilon = 1e-6);

        let average = weighted_average_rtt(Some(average), Duration::from_millis(20));
        assert_relative_eq!(
            average.as_secs_f64() * 1000.0,
            0.2 * 20.0 + 0.8 * 120.0,
            epsilon = 1e-6
        );
    }
}

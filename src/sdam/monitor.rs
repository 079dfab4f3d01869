use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::{
    description::server::{ServerDescription, TopologyVersion},
    topology::{SdamEventEmitter, TopologyUpdater, TopologyWatcher},
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::{Error, Result},
    event::sdam::{
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, AwaitableHelloOptions, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime::{self, WorkerHandle, WorkerHandleListener},
    sdam::description::topology::server_selection::DEFAULT_HEARTBEAT_FREQUENCY,
};

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// The weight of a new round-trip-time sample in the exponentially weighted moving average.
const RTT_ALPHA: f64 = 0.2;

/// Requests an immediate check from a server's monitor.
#[derive(Clone, Debug)]
pub(crate) struct MonitorRequester {
    sender: mpsc::UnboundedSender<()>,
}

impl MonitorRequester {
    /// Ask the monitor to check its server as soon as possible rather than waiting out the rest
    /// of the heartbeat interval.
    pub(crate) fn request_immediate_check(&self) {
        let _: std::result::Result<_, _> = self.sender.send(());
    }
}

/// Monitor that performs regular heartbeats to determine server status. Exactly one exists per
/// address in the topology; it owns a dedicated monitoring connection that is never shared with
/// the application pool.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    event_emitter: SdamEventEmitter,
    request_receiver: mpsc::UnboundedReceiver<()>,
    client_options: ClientOptions,

    /// Closed when the monitor's `Server` is dropped, retiring the monitor with it. This is what
    /// upholds the one-monitor-per-address invariant when an address leaves and rejoins the
    /// topology.
    handle_listener: WorkerHandleListener,

    /// The most recent RTT estimate, fed by non-awaited checks.
    average_round_trip_time: Option<Duration>,

    /// The topology version from the server's last reply. Its presence switches the monitor to
    /// streaming mode, where an awaitable hello is kept outstanding instead of sleeping between
    /// polls.
    topology_version: Option<TopologyVersion>,
}

impl Monitor {
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        event_emitter: SdamEventEmitter,
        establisher: ConnectionEstablisher,
        client_options: ClientOptions,
    ) -> (MonitorRequester, WorkerHandle) {
        let (sender, request_receiver) = mpsc::unbounded_channel();
        let (handle, handle_listener) = WorkerHandleListener::channel();
        let monitor = Self {
            address,
            connection: None,
            establisher,
            topology_updater,
            topology_watcher,
            event_emitter,
            request_receiver,
            client_options,
            handle_listener,
            average_round_trip_time: None,
            topology_version: None,
        };
        runtime::spawn(monitor.execute());
        (MonitorRequester { sender }, handle)
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);

        while self.is_alive() {
            self.check_server().await;

            if !self.is_alive() {
                break;
            }

            // In streaming mode the awaitable hello itself provides the pacing, so the monitor
            // loops immediately. Otherwise wait out the heartbeat interval, cutting it short if
            // an immediate check is requested; the minimum frequency is always honored so a
            // flood of requests cannot hammer the server.
            if self.topology_version.is_none() {
                runtime::delay_for(MIN_HEARTBEAT_FREQUENCY).await;
                self.wait_for_check_request(
                    heartbeat_frequency.saturating_sub(MIN_HEARTBEAT_FREQUENCY),
                )
                .await;
            }
        }
    }

    /// The monitor runs as long as the topology exists and its `Server` has not been retired.
    fn is_alive(&mut self) -> bool {
        self.handle_listener.check_if_alive() && self.topology_watcher.is_alive()
    }

    /// Checks the server by running `hello`. If an I/O error occurs mid-conversation with a
    /// previously available server, the check is retried once on a fresh connection before the
    /// server is declared unknown.
    async fn check_server(&mut self) -> bool {
        self.clear_check_requests();

        let mut retried = false;
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.topology_version = None;
                self.average_round_trip_time = None;

                let previous_description =
                    self.topology_watcher.server_description(&self.address);
                if e.is_network_error()
                    && previous_description
                        .map(|sd| sd.is_available())
                        .unwrap_or(false)
                {
                    self.handle_error(e).await;
                    retried = true;
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                let description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    self.average_round_trip_time.unwrap_or(Duration::ZERO),
                );
                self.topology_version = description.topology_version();
                self.topology_updater.update(description).await
            }
            Err(e) => self.handle_error(e).await || retried,
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        let awaited = self.topology_version.is_some() && self.connection.is_some();
        self.event_emitter.emit(|handler| {
            handler.handle_server_heartbeat_started_event(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                awaited,
            })
        });

        let heartbeat_frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                let awaitable_options =
                    self.topology_version
                        .map(|topology_version| AwaitableHelloOptions {
                            topology_version,
                            max_await_time: heartbeat_frequency,
                        });

                let command = hello_command(
                    conn.stream_description()
                        .ok()
                        .map(|description| description.hello_ok),
                    awaitable_options,
                );

                // An awaited hello legitimately blocks until the topology changes or the await
                // time elapses, so its read deadline extends past the await window.
                let timeout = if awaited {
                    heartbeat_frequency
                        + self
                            .client_options
                            .connect_timeout
                            .unwrap_or(Duration::from_secs(10))
                } else {
                    self.client_options
                        .connect_timeout
                        .unwrap_or(Duration::from_secs(10))
                };

                let response = conn
                    .send_command_with_timeout(command, None, Some(timeout))
                    .await;
                response.and_then(|response| {
                    let body = response.into_body();
                    let command_response = bson::from_document(body.clone())?;
                    Ok(HelloReply {
                        server_address: self.address.clone(),
                        command_response,
                        raw_command_response: body,
                    })
                })
            }
            None => {
                let result = self
                    .establisher
                    .establish_monitoring_connection(self.address.clone())
                    .await;
                match result {
                    Ok((connection, reply)) => {
                        self.connection = Some(connection);
                        Ok(reply)
                    }
                    Err(e) => Err(e),
                }
            }
        };
        let duration = start.elapsed();

        match result {
            Ok(ref reply) => {
                if !awaited {
                    self.update_average_round_trip_time(duration);
                }

                let mut reply_doc = reply.raw_command_response.clone();
                // A handshake hello may carry credentials-adjacent material.
                reply_doc.remove("speculativeAuthenticate");
                self.event_emitter.emit(|handler| {
                    handler.handle_server_heartbeat_succeeded_event(ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply_doc,
                        server_address: self.address.clone(),
                        awaited,
                    })
                });
            }
            Err(ref e) => {
                self.connection.take();
                self.event_emitter.emit(|handler| {
                    handler.handle_server_heartbeat_failed_event(ServerHeartbeatFailedEvent {
                        duration,
                        failure: e.clone(),
                        server_address: self.address.clone(),
                        awaited,
                    })
                });
            }
        }

        result
    }

    /// Smooths the round trip time using an exponentially weighted moving average, seeded with
    /// the first sample.
    fn update_average_round_trip_time(&mut self, sample: Duration) {
        self.average_round_trip_time = Some(match self.average_round_trip_time {
            Some(average) => {
                sample.mul_f64(RTT_ALPHA) + average.mul_f64(1.0 - RTT_ALPHA)
            }
            None => sample,
        });
    }

    async fn handle_error(&mut self, error: Error) -> bool {
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }

    async fn wait_for_check_request(&mut self, timeout: Duration) {
        let _: Result<_> = runtime::timeout(timeout, self.request_receiver.recv()).await;
    }

    fn clear_check_requests(&mut self) {
        while self.request_receiver.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_seeds_with_first_sample() {
        let mut monitor_rtt: Option<Duration> = None;

        let mut update = |sample_ms: u64| {
            let sample = Duration::from_millis(sample_ms);
            monitor_rtt = Some(match monitor_rtt {
                Some(average) => sample.mul_f64(RTT_ALPHA) + average.mul_f64(1.0 - RTT_ALPHA),
                None => sample,
            });
            monitor_rtt.unwrap()
        };

        assert_eq!(update(100), Duration::from_millis(100));

        // 0.2 * 50 + 0.8 * 100 = 90
        let second = update(50);
        approx::assert_relative_eq!(second.as_secs_f64(), 0.090, epsilon = 0.001);

        // 0.2 * 90 + 0.8 * 90 = 90
        let third = update(90);
        approx::assert_relative_eq!(third.as_secs_f64(), 0.090, epsilon = 0.001);
    }
}

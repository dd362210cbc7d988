//! MQTT broker bridge.
//!
//! [`connect`] opens one connection with the service status as last will,
//! waits for the broker to accept it and subscribes to the command
//! namespace. The connection is then split in two:
//!
//! - [`MqttPublisher`] implements the core's [`Publisher`] on top of the
//!   client's request queue, which serialises concurrent publishes.
//! - [`MqttListener`] drives the event loop, forwarding every inbound
//!   publish into the coordinator's intake in arrival order and
//!   resubscribing after every reconnect.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    Publish, QoS,
};
use tokio::sync::mpsc;

use mealiemate_core::entity::SWITCH_OFF;
use mealiemate_core::{InboundMessage, Namespace, OutboundMessage, Publisher};

use crate::config::MqttConfig;

/// Pending requests buffered by the client before publishes wait.
const REQUEST_CAPACITY: usize = 64;

/// Exponential reconnect delay with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub const INITIAL: Duration = Duration::from_secs(1);
    pub const MAX: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    pub fn reset(&mut self) {
        self.current = Self::INITIAL;
    }

    /// The delay before the next attempt: the current step plus up to a
    /// quarter of it as jitter. Doubles the step, capped at [`Self::MAX`].
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        let quarter = (base.as_millis() / 4) as u64;
        base + Duration::from_millis(rand::rng().random_range(0..=quarter))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

fn options(config: &MqttConfig, namespace: &Namespace) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);
    if let Some((username, password)) = config.credentials() {
        options.set_credentials(username, password);
    }
    options.set_last_will(LastWill::new(
        namespace.status_topic(),
        SWITCH_OFF,
        QoS::AtLeastOnce,
        true,
    ));
    options
}

fn subscribe(client: &AsyncClient, namespace: &Namespace) -> Result<()> {
    for filter in [namespace.command_filter(), namespace.hub_status_topic()] {
        client
            .try_subscribe(filter.as_str(), QoS::AtLeastOnce)
            .with_context(|| format!("failed to subscribe to {filter}"))?;
        tracing::debug!(filter = %filter, "subscribed");
    }
    Ok(())
}

fn to_inbound(publish: Publish) -> InboundMessage {
    InboundMessage {
        topic: publish.topic,
        payload: publish.payload.to_vec(),
        retained: publish.retain,
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await.context("connection failed")? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    bail!("broker refused the connection: {:?}", ack.code);
                }
                return Ok(());
            }
            _ => continue,
        }
    }
}

/// Connect to the broker. Failure to get a `ConnAck` within the configured
/// timeout is fatal.
pub async fn connect(
    config: &MqttConfig,
    namespace: &Namespace,
) -> Result<(MqttPublisher, MqttListener)> {
    let (client, mut eventloop) = AsyncClient::new(options(config, namespace), REQUEST_CAPACITY);
    let address = format!("{}:{}", config.host, config.port);

    tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut eventloop))
        .await
        .map_err(|_| {
            anyhow!(
                "no response from MQTT broker at {address} within {}s",
                config.connect_timeout.as_secs()
            )
        })?
        .with_context(|| format!("failed to connect to MQTT broker at {address}"))?;
    tracing::info!(broker = %address, client_id = %config.client_id, "connected to MQTT broker");

    subscribe(&client, namespace)?;

    let publisher = MqttPublisher {
        client: client.clone(),
        namespace: namespace.clone(),
    };
    let listener = MqttListener {
        client,
        eventloop,
        namespace: namespace.clone(),
        backoff: Backoff::new(),
    };
    Ok((publisher, listener))
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Outbound half of the broker connection.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    namespace: Namespace,
}

impl MqttPublisher {
    /// Unsubscribe, mark the service offline and close the connection. The
    /// listener keeps polling until the disconnect has gone out.
    pub async fn disconnect(&self) -> Result<()> {
        for filter in [self.namespace.command_filter(), self.namespace.hub_status_topic()] {
            self.client
                .unsubscribe(filter.as_str())
                .await
                .with_context(|| format!("failed to unsubscribe from {filter}"))?;
        }
        self.client
            .publish(
                self.namespace.status_topic(),
                QoS::AtLeastOnce,
                true,
                SWITCH_OFF,
            )
            .await
            .context("failed to publish offline status")?;
        self.client
            .disconnect()
            .await
            .context("failed to disconnect from MQTT broker")?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let OutboundMessage {
            topic,
            payload,
            retain,
        } = message;
        self.client
            .publish(topic.as_str(), QoS::AtLeastOnce, retain, payload)
            .await
            .with_context(|| format!("failed to publish to {topic}"))
    }
}

impl std::fmt::Debug for MqttPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttPublisher")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Inbound half of the broker connection; owns the event loop.
pub struct MqttListener {
    client: AsyncClient,
    eventloop: EventLoop,
    namespace: Namespace,
    backoff: Backoff,
}

impl MqttListener {
    /// Poll until the connection is closed by [`MqttPublisher::disconnect`]
    /// or the intake is dropped. Connection errors never end the loop; the
    /// next poll reconnects after a backoff delay.
    pub async fn run(mut self, intake: mpsc::UnboundedSender<InboundMessage>) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("reconnected to MQTT broker");
                    self.backoff.reset();
                    if let Err(e) = subscribe(&self.client, &self.namespace) {
                        tracing::error!(error = %format!("{e:#}"), "failed to resubscribe");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = to_inbound(publish);
                    tracing::trace!(topic = %message.topic, retained = message.retained, "inbound message");
                    if intake.send(message).is_err() {
                        tracing::debug!("intake closed, stopping listener");
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::info!("disconnected from MQTT broker");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "MQTT connection error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for MqttListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttListener")
            .field("namespace", &self.namespace)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::new();
        let mut steps = Vec::new();
        for _ in 0..9 {
            steps.push(backoff.next_delay());
        }
        for (delay, base) in steps.iter().zip([1u64, 2, 4, 8, 16, 32, 60, 60, 60]) {
            let base = Duration::from_secs(base);
            assert!(*delay >= base, "{delay:?} < {base:?}");
            assert!(*delay <= base + base / 4, "{delay:?} too large for {base:?}");
        }
    }

    #[test]
    fn backoff_reset_starts_over() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_secs(2));
    }

    #[test]
    fn options_carry_retained_last_will() {
        let mut config = MqttConfig::new("broker.local");
        config.client_id = "mm-test".into();
        let options = options(&config, &Namespace::default());

        assert_eq!(options.client_id(), "mm-test");
        assert_eq!(options.broker_address(), ("broker.local".to_owned(), 1883));
        let will = options.last_will().unwrap();
        assert!(will.retain);
        assert_eq!(will.qos, QoS::AtLeastOnce);
    }

    #[test]
    fn publish_becomes_inbound_message() {
        let mut publish = Publish::new("mealiemate/shopping_list/days/set", QoS::AtLeastOnce, "3");
        publish.retain = true;
        let message = to_inbound(publish);
        assert_eq!(message.topic, "mealiemate/shopping_list/days/set");
        assert_eq!(message.payload, b"3");
        assert!(message.retained);
    }
}

//! Redis pub/sub backed [`Bus`].
//!
//! Subscriptions are issued as `PSUBSCRIBE` globs derived from the topic
//! filter and narrowed again locally by [`TopicRouter`]. The subscriber
//! connection reconnects after a fixed delay and re-issues every filter.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisResult};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Bus, BusError, BusMessage, BusResult, LinkState, TopicRouter};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct RedisBus {
    router: Arc<TopicRouter>,
    link: Arc<watch::Sender<LinkState>>,
    outbound: mpsc::UnboundedSender<BusMessage>,
    filters: mpsc::UnboundedSender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl RedisBus {
    /// Opens the bus and spawns its connection tasks on the current runtime.
    pub fn connect(url: &str) -> BusResult<Self> {
        Self::connect_with_delay(url, DEFAULT_RECONNECT_DELAY)
    }

    pub fn connect_with_delay(url: &str, reconnect_delay: Duration) -> BusResult<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|err| BusError::Transport(format!("invalid redis url {url}: {err}")))?;
        let router = Arc::new(TopicRouter::default());
        let link = Arc::new(watch::channel(LinkState::Down).0);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (filters, filters_rx) = mpsc::unbounded_channel();

        let subscriber = tokio::spawn(run_subscriber(
            client.clone(),
            Arc::clone(&router),
            Arc::clone(&link),
            filters_rx,
            reconnect_delay,
        ));
        let publisher = tokio::spawn(run_publisher(client, outbound_rx));

        Ok(Self {
            router,
            link,
            outbound,
            filters,
            tasks: vec![subscriber, publisher],
        })
    }
}

impl Bus for RedisBus {
    fn subscribe(&self, filter: &str) -> broadcast::Receiver<BusMessage> {
        let receiver = self.router.subscribe(filter);
        let _ = self.filters.send(filter.to_string());
        receiver
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        if *self.link.borrow() == LinkState::Down {
            return Err(BusError::Closed);
        }
        self.outbound
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| BusError::Closed)
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Translates a topic filter into a redis glob pattern.
fn filter_to_glob(filter: &str) -> String {
    filter
        .split('/')
        .map(|segment| match segment {
            "+" | "#" => "*",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/")
}

async fn run_subscriber(
    client: ::redis::Client,
    router: Arc<TopicRouter>,
    link: Arc<watch::Sender<LinkState>>,
    mut filters_rx: mpsc::UnboundedReceiver<String>,
    reconnect_delay: Duration,
) {
    let mut known: Vec<String> = Vec::new();
    loop {
        while let Ok(filter) = filters_rx.try_recv() {
            if !known.contains(&filter) {
                known.push(filter);
            }
        }

        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                let mut subscribed = true;
                for filter in &known {
                    if let Err(err) = pubsub.psubscribe(filter_to_glob(filter)).await {
                        warn!(target: "transport_bus", error = %err, filter = %filter, "redis psubscribe failed");
                        subscribed = false;
                        break;
                    }
                }
                if subscribed {
                    info!(target: "transport_bus", filters = known.len(), "redis pub/sub link up");
                    link.send_replace(LinkState::Up);
                    loop {
                        let next_filter = {
                            let mut stream = pubsub.on_message();
                            loop {
                                tokio::select! {
                                    message = stream.next() => match message {
                                        Some(message) => {
                                            router.dispatch(BusMessage {
                                                topic: message.get_channel_name().to_string(),
                                                payload: Bytes::copy_from_slice(message.get_payload_bytes()),
                                            });
                                        }
                                        None => break None,
                                    },
                                    filter = filters_rx.recv() => match filter {
                                        Some(filter) => break Some(filter),
                                        None => {
                                            link.send_replace(LinkState::Down);
                                            return;
                                        }
                                    },
                                }
                            }
                        };
                        let Some(filter) = next_filter else {
                            break;
                        };
                        if known.contains(&filter) {
                            continue;
                        }
                        if let Err(err) = pubsub.psubscribe(filter_to_glob(&filter)).await {
                            warn!(target: "transport_bus", error = %err, filter = %filter, "redis psubscribe failed");
                            known.push(filter);
                            break;
                        }
                        debug!(target: "transport_bus", filter = %filter, "redis psubscribe");
                        known.push(filter);
                    }
                    warn!(target: "transport_bus", "redis pub/sub link down");
                    link.send_replace(LinkState::Down);
                }
            }
            Err(err) => {
                debug!(target: "transport_bus", error = %err, "redis pub/sub connect failed");
            }
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn run_publisher(client: ::redis::Client, mut outbound_rx: mpsc::UnboundedReceiver<BusMessage>) {
    let mut connection: Option<ConnectionManager> = None;
    while let Some(message) = outbound_rx.recv().await {
        if connection.is_none() {
            match client.get_connection_manager().await {
                Ok(manager) => connection = Some(manager),
                Err(err) => {
                    warn!(target: "transport_bus", error = %err, topic = %message.topic, "redis publish dropped");
                    continue;
                }
            }
        }
        let Some(manager) = connection.as_mut() else {
            continue;
        };
        let result: RedisResult<i64> = manager.publish(&message.topic, message.payload.to_vec()).await;
        if let Err(err) = result {
            warn!(target: "transport_bus", error = %err, topic = %message.topic, "redis publish failed");
        }
    }
}

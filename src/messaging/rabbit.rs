use std::collections::HashSet;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
  acker::Acker,
  message::Delivery,
  options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
  },
  publisher_confirm::Confirmation,
  types::{AMQPValue, FieldTable},
  BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::Mutex;
use tokio_retry::{Retry, RetryIf};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Acknowledge, DurableLog, LogRecord, RecordStream};
use crate::error::LogError;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

// 7 days, the longest horizon a pending task is expected to wait
const RETENTION_MS: u32 = 7 * 24 * 60 * 60 * 1000;
// records stay unacknowledged until their task finishes, so the broker must
// not reclaim them after its default 30 minute consumer timeout
const CONSUMER_TIMEOUT_MS: u32 = RETENTION_MS;
const PERSISTENT: u8 = 2;

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> anyhow::Result<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  channel.confirm_select(ConfirmSelectOptions::default()).await?;
  info!("RabbitMQ channel created with publisher confirms");
  Ok(channel)
}

/// Publishes a persistent, mandatory message and waits for the broker's
/// confirm. A message no queue is bound to receive comes back as
/// `Unroutable` instead of being silently dropped.
pub async fn publish_message(channel: &Channel, exchange: &str, payload: &[u8]) -> Result<(), LogError> {
  RetryIf::spawn(
    ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES),
    move || async move {
      let confirmation = channel
        .basic_publish(
          exchange,
          "",
          BasicPublishOptions { mandatory: true, ..Default::default() },
          payload,
          BasicProperties::default().with_delivery_mode(PERSISTENT),
        )
        .await?
        .await?;
      confirmed(exchange, confirmation)
    },
    is_retryable,
  )
  .await
}

fn confirmed(exchange: &str, confirmation: Confirmation) -> Result<(), LogError> {
  match confirmation {
    Confirmation::Nack(_) => Err(LogError::NotConfirmed),
    Confirmation::Ack(Some(returned)) => {
      warn!(exchange, reply = returned.reply_text.as_str(), "broker returned an unroutable record");
      Err(LogError::Unroutable(exchange.to_string()))
    }
    _ => Ok(()),
  }
}

fn is_retryable(e: &LogError) -> bool {
  !matches!(e, LogError::Unroutable(_))
}

fn group_arguments() -> FieldTable {
  let mut arguments = FieldTable::default();
  arguments.insert("x-message-ttl".into(), AMQPValue::LongUInt(RETENTION_MS));
  arguments.insert("x-consumer-timeout".into(), AMQPValue::LongUInt(CONSUMER_TIMEOUT_MS));
  arguments
}

/// RabbitMQ-backed log. A topic is a durable fanout exchange; a consumer
/// group is a durable queue bound to it, shared by the group's members.
/// A closed channel is replaced on the next call when the log knows its
/// broker url.
pub struct RabbitLog {
  url: Option<String>,
  channel: Mutex<Channel>,
  declared: Mutex<HashSet<String>>,
}

impl RabbitLog {
  pub fn new(channel: Channel) -> Self {
    Self { url: None, channel: Mutex::new(channel), declared: Mutex::new(HashSet::new()) }
  }

  pub async fn connect(rabbitmq_url: &str) -> anyhow::Result<Self> {
    let channel = create_rabbit_channel(rabbitmq_url).await?;
    Ok(Self { url: Some(rabbitmq_url.to_string()), ..Self::new(channel) })
  }

  async fn channel(&self) -> Result<Channel, LogError> {
    let mut channel = self.channel.lock().await;
    if channel.status().connected() {
      return Ok(channel.clone());
    }
    let Some(url) = &self.url else {
      return Err(LogError::Unavailable("RabbitMQ channel is closed".into()));
    };
    warn!("RabbitMQ channel closed, reconnecting");
    *channel = create_rabbit_channel(url).await.map_err(|e| LogError::Unavailable(e.to_string()))?;
    // declarations are redone on the new channel
    self.declared.lock().await.clear();
    Ok(channel.clone())
  }

  async fn declare_topic(&self, channel: &Channel, topic: &str) -> Result<(), LogError> {
    let mut declared = self.declared.lock().await;
    if declared.contains(topic) {
      return Ok(());
    }
    channel
      .exchange_declare(
        topic,
        ExchangeKind::Fanout,
        ExchangeDeclareOptions { durable: true, ..Default::default() },
        FieldTable::default(),
      )
      .await?;
    declared.insert(topic.to_string());
    debug!(topic, "exchange declared");
    Ok(())
  }

  async fn declare_group(&self, channel: &Channel, topic: &str, group: &str) -> Result<String, LogError> {
    self.declare_topic(channel, topic).await?;
    let queue = format!("{topic}.{group}");
    channel
      .queue_declare(&queue, QueueDeclareOptions { durable: true, ..Default::default() }, group_arguments())
      .await?;
    channel
      .queue_bind(&queue, topic, "", QueueBindOptions::default(), FieldTable::default())
      .await?;
    debug!(queue = %queue, "group queue declared");
    Ok(queue)
  }
}

#[async_trait]
impl DurableLog for RabbitLog {
  async fn append(&self, topic: &str, record: &[u8]) -> Result<(), LogError> {
    let channel = self.channel().await?;
    self.declare_topic(&channel, topic).await?;
    publish_message(&channel, topic, record).await
  }

  async fn subscribe(&self, topic: &str, group: &str) -> Result<RecordStream, LogError> {
    let channel = self.channel().await?;
    let queue = self.declare_group(&channel, topic, group).await?;
    let consumer = channel
      .basic_consume(
        &queue,
        &format!("{group}-{}", Uuid::new_v4()),
        BasicConsumeOptions::default(),
        FieldTable::default(),
      )
      .await?;
    info!(queue = %queue, "subscribed to durable log");

    let records = consumer.map(|delivery: Result<Delivery, lapin::Error>| -> Result<LogRecord, LogError> {
      let delivery = delivery?;
      Ok(LogRecord::new(delivery.data, delivery.redelivered, RabbitAck(delivery.acker)))
    });
    Ok(records.boxed())
  }
}

struct RabbitAck(Acker);

#[async_trait]
impl Acknowledge for RabbitAck {
  async fn ack(&self) -> Result<(), LogError> {
    self.0.ack(BasicAckOptions::default()).await?;
    Ok(())
  }
}

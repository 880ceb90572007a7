//! RabbitMQ publisher and consumer backed by `lapin`.

use crate::config::RabbitMqSettings;
use crate::message::{AckHandle, HeaderValue, Headers, PublishMetadata, QueueDelivery};
use crate::traits::{QueueBroker, QueueConsumer, QueuePublisher, PREFETCH};
use crate::{RelayError, RelayResult};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

/// One connection and one confirm-mode channel
///
/// Serves as durable publisher (bridge) and as prefetch-1 consumer with
/// manual acknowledgment (queue consumer).
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    consumer: Option<(String, lapin::Consumer)>,
    consumer_tag: String,
}

impl AmqpBroker {
    /// Connect, open a channel and enable publisher confirms and QoS
    ///
    /// Failures here are fatal: wrong credentials or an unreachable broker
    /// at startup stop the process.
    pub async fn connect(settings: &RabbitMqSettings, consumer_tag: &str) -> RelayResult<Self> {
        let connection = Connection::connect(&settings.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| RelayError::fatal_with_source("Failed to connect to RabbitMQ", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RelayError::fatal_with_source("Failed to open channel", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| RelayError::fatal_with_source("Failed to enable publisher confirms", e))?;

        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .map_err(|e| RelayError::fatal_with_source("Failed to set prefetch", e))?;

        info!(
            host = %settings.host,
            port = settings.port,
            vhost = %settings.vhost,
            "Connected to RabbitMQ"
        );

        Ok(Self {
            connection,
            channel,
            consumer: None,
            consumer_tag: consumer_tag.to_string(),
        })
    }
}

/// Socket errors are transient; a closed channel or connection, or a broker
/// protocol error, leaves the session unusable.
fn classify(err: lapin::Error, context: &str) -> RelayError {
    match &err {
        lapin::Error::IOError(_) => RelayError::retryable_with_source(context, err),
        _ => RelayError::fatal_with_source(context, err),
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.clone())),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => {
                    HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
                AMQPValue::ShortShortInt(i) => HeaderValue::Int((*i).into()),
                AMQPValue::ShortShortUInt(i) => HeaderValue::Int((*i).into()),
                AMQPValue::ShortInt(i) => HeaderValue::Int((*i).into()),
                AMQPValue::ShortUInt(i) => HeaderValue::Int((*i).into()),
                AMQPValue::LongInt(i) => HeaderValue::Int((*i).into()),
                AMQPValue::LongUInt(i) => HeaderValue::Int((*i).into()),
                AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

#[async_trait]
impl QueueBroker for AmqpBroker {
    async fn ensure_destination(&mut self, name: &str) -> RelayResult<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "Queue declare failed"))
    }

    async fn close(&mut self) -> RelayResult<()> {
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "Bye")
                .await
                .map_err(|e| classify(e, "Channel close failed"))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "Bye")
                .await
                .map_err(|e| classify(e, "Connection close failed"))?;
        }
        info!("RabbitMQ connection closed");
        Ok(())
    }
}

#[async_trait]
impl QueuePublisher for AmqpBroker {
    async fn publish(
        &mut self,
        destination: &str,
        payload: &[u8],
        metadata: &PublishMetadata,
    ) -> RelayResult<()> {
        let mut properties = BasicProperties::default().with_headers(to_field_table(&metadata.headers));
        if metadata.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }
        if let Some(content_type) = &metadata.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.clone()));
        }

        let confirmation = self
            .channel
            .basic_publish(
                "",
                destination,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| classify(e, "Publish failed"))?
            .await
            .map_err(|e| classify(e, "Publish confirmation failed"))?;

        match confirmation {
            Confirmation::Ack(_) => Ok(()),
            Confirmation::Nack(_) => Err(RelayError::retryable(format!(
                "Broker rejected publish to '{}'",
                destination
            ))),
            Confirmation::NotRequested => Err(RelayError::fatal(
                "Publisher confirms are not enabled on the channel",
            )),
        }
    }
}

#[async_trait]
impl QueueConsumer for AmqpBroker {
    async fn consume(&mut self, queue: &str) -> RelayResult<()> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(e, "Failed to start consumer"))?;

        debug!(queue, consumer_tag = %self.consumer_tag, "Consumer started");
        self.consumer = Some((queue.to_string(), consumer));
        Ok(())
    }

    async fn recv(&mut self) -> RelayResult<Option<QueueDelivery>> {
        let Some((queue, consumer)) = self.consumer.as_mut() else {
            return Err(RelayError::fatal("recv called before consume"));
        };

        match consumer.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(classify(e, "Receive failed")),
            Some(Ok(delivery)) => {
                let headers = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(from_field_table)
                    .unwrap_or_default();

                Ok(Some(
                    QueueDelivery::new(
                        queue.clone(),
                        delivery.data,
                        AckHandle::new(delivery.delivery_tag),
                    )
                    .with_headers(headers)
                    .with_redelivered(delivery.redelivered),
                ))
            }
        }
    }

    async fn ack(&mut self, handle: AckHandle) -> RelayResult<()> {
        self.channel
            .basic_ack(handle.tag(), BasicAckOptions::default())
            .await
            .map_err(|e| classify(e, "Ack failed"))
    }

    async fn nack(&mut self, handle: AckHandle, requeue: bool) -> RelayResult<()> {
        self.channel
            .basic_nack(
                handle.tag(),
                BasicNackOptions {
                    requeue,
                    multiple: false,
                },
            )
            .await
            .map_err(|e| classify(e, "Nack failed"))
    }
}

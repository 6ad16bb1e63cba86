use lapin::{Channel, Connection, ConnectionProperties};
use tracing::{error, info};
use url::Url;

pub struct RabbitMqConnection {
    connection: Connection,
    endpoint: String,
}

impl RabbitMqConnection {
    pub async fn connect(url: &str) -> Result<Self, ConnectionError> {
        let endpoint = redact_credentials(url);
        info!(endpoint = %endpoint, "Connecting to RabbitMQ");

        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                error!(error = %e, endpoint = %endpoint, "Failed to connect to RabbitMQ");
                ConnectionError::ConnectionFailed(e.to_string())
            })?;

        info!(endpoint = %endpoint, "Successfully connected to RabbitMQ");

        Ok(Self {
            connection,
            endpoint,
        })
    }

    pub async fn open_channel(&self) -> Result<Channel, ConnectionError> {
        let channel = self.connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ channel");
            ConnectionError::ChannelFailed(e.to_string())
        })?;

        info!(channel_id = channel.id(), "Channel created successfully");
        Ok(channel)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn shutdown(self) -> Result<(), ConnectionError> {
        info!(endpoint = %self.endpoint, "Shutting down RabbitMQ connection");

        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to close RabbitMQ connection gracefully");
                ConnectionError::ShutdownFailed(e.to_string())
            })?;

        info!("RabbitMQ connection closed successfully");
        Ok(())
    }
}

/// Masks the password of an AMQP URL so it can be logged.
pub fn redact_credentials(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to RabbitMQ: {0}")]
    ConnectionFailed(String),

    #[error("Failed to create channel: {0}")]
    ChannelFailed(String),

    #[error("Failed to shutdown connection gracefully: {0}")]
    ShutdownFailed(String),
}

use redis::aio::{ConnectionManager, PubSub};

use crate::error::ForgeError;

/// Thin wrapper over the Redis client: prefixed key builder, multiplexed
/// connection with automatic reconnects, and Pub/Sub subscriptions.
///
/// Callers issue commands and pipelines against clones of the managed
/// connection; logically-atomic pairs go through `redis::pipe()` so both
/// operations land in one round trip.
#[derive(Clone)]
pub struct StoreClient {
    client: redis::Client,
    manager: ConnectionManager,
    prefix: String,
}

impl StoreClient {
    /// Connects to Redis from a `redis://` URL and key prefix.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, ForgeError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            client,
            manager,
            prefix: prefix.to_string(),
        })
    }

    /// Returns a prefixed key joined from colon-separated parts.
    pub fn key(&self, parts: &[&str]) -> String {
        build_key(&self.prefix, parts)
    }

    /// Returns a clone of the multiplexed connection for command execution.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Opens a dedicated connection for blocking pops. `BLPOP` parks the
    /// connection it runs on, so queue consumers must not share the
    /// multiplexed one.
    pub async fn blocking_connection(
        &self,
    ) -> Result<redis::aio::MultiplexedConnection, ForgeError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Checks connectivity.
    pub async fn ping(&self) -> Result<(), ForgeError> {
        let mut conn = self.connection();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Opens a dedicated Pub/Sub connection subscribed to the given channels.
    pub async fn subscriber(&self, channels: &[String]) -> Result<PubSub, ForgeError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        Ok(pubsub)
    }
}

fn build_key(prefix: &str, parts: &[&str]) -> String {
    format!("{}{}", prefix, parts.join(":"))
}

#[cfg(test)]
mod tests {
    use super::build_key;

    #[test]
    fn unit_key_layout_is_prefixed_and_colon_joined() {
        assert_eq!(
            build_key("codeforge:", &["task", "abc", "state"]),
            "codeforge:task:abc:state"
        );
        assert_eq!(build_key("", &["queue", "tasks"]), "queue:tasks");
    }
}

use redis::Client;
use redis::aio::ConnectionManager;

/// Open a Redis client and a connection manager for async commands.
///
/// The client is kept so callers can open dedicated pub/sub connections;
/// the manager multiplexes ordinary commands such as `PUBLISH`.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<(Client, ConnectionManager)> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client.clone()).await?;

    tracing::info!("Connected to Redis");
    Ok((client, manager))
}

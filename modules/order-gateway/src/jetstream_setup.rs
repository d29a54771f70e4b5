use async_nats::jetstream::{self, stream::Config};
use async_nats::Client;
use std::time::Duration;

/// Stream name for a topic: `orders_processing` -> `ORDERS_PROCESSING`
pub fn stream_name(topic: &str) -> String {
    topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Create the stream backing `topic` unless it already exists
///
/// The duplicate window bounds how long a resubmitted record with the same
/// `Nats-Msg-Id` is discarded by the broker.
pub async fn ensure_stream(
    nats: Client,
    topic: &str,
    max_age: Duration,
    duplicate_window: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let js = jetstream::new(nats);
    let name = stream_name(topic);

    if js.get_stream(&name).await.is_ok() {
        tracing::info!(stream = %name, "JetStream stream present");
        return Ok(());
    }

    let cfg = Config {
        name: name.clone(),
        subjects: vec![topic.to_string()],
        max_age,
        duplicate_window,
        ..Default::default()
    };
    js.create_stream(cfg).await?;
    tracing::info!(stream = %name, subject = %topic, "Created JetStream stream");

    Ok(())
}

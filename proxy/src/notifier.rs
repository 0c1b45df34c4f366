//! Best-effort push notification sink.

use reqwest::Client;

const TITLE: &str = "Sune Proxy";

/// Wraps an optional `ntfy`-style endpoint. A `None` endpoint makes every
/// call a no-op.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    url: Option<String>,
}

impl Notifier {
    /// Build a notifier posting to `url`, or a no-op sink when `url` is `None`.
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    /// Fire-and-forget a text notification. Errors are logged at `warn` and
    /// otherwise swallowed; this must never hold up the run coordinator.
    pub async fn notify(&self, message: impl Into<String>, priority: i32, tags: &[&str]) {
        let Some(url) = &self.url else { return };
        let message = message.into();

        let result = self
            .client
            .post(url)
            .header("Title", TITLE)
            .header("Priority", priority.to_string())
            .header("Tags", tags.join(","))
            .body(message)
            .send()
            .await;

        if let Err(e) = result {
            log::warn!("notification delivery failed: {e}");
        }
    }

    /// Fire [`Self::notify`] on a detached task so the caller never waits on
    /// the HTTP round-trip. The run coordinator's actor loop is the single
    /// writer of a uid's state and must not block on anything but the
    /// adapter stream itself; a notification send is "fire-and-forget" in
    /// the literal sense.
    pub fn notify_detached(&self, message: impl Into<String> + Send + 'static, priority: i32, tags: &'static [&'static str]) {
        if self.url.is_none() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.notify(message, priority, tags).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unset_url_is_a_silent_no_op() {
        let notifier = Notifier::new(None);
        notifier.notify("hello", 3, &["run"]).await;
    }
}

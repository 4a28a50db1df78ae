use super::message::Message;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Callback invoked by the delivery engine for each delivered message.
///
/// Returning an error (or panicking) counts as a handler fault: it is caught
/// per recipient and, with reliability enabled, schedules a redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Arc<Message>) -> anyhow::Result<()>;
}

/// Handler reference owned by a subscription for its lifetime.
pub type SharedHandler = Arc<dyn MessageHandler>;

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Arc<Message>) -> anyhow::Result<()> {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```ignore
/// let handler = handler_fn(|message| async move {
///     tracing::info!(id = %message.id, "received");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::message::MessageTarget;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn closure_handler_is_invoked() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handler = handler_fn(move |_message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let message = Arc::new(Message::new(
            "a",
            MessageTarget::Agent("b".into()),
            "ping",
            serde_json::json!({}),
        ));
        handler.handle(Arc::clone(&message)).await.unwrap();
        handler.handle(message).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}

//! Outbound observer event channel.

use snare_core::ProxyEvent;
use tokio::sync::mpsc;

/// Sending half of the observer channel.
///
/// Emitting never fails the transaction: if the observer is gone the event
/// is logged and discarded.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ProxyEvent>,
}

impl EventSink {
    /// Creates a sink and its receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProxyEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Sends an event, waiting for capacity.
    pub async fn emit(&self, event: ProxyEvent) {
        if let Err(e) = self.tx.send(event).await {
            tracing::debug!(
                "Observer gone, dropping {} event",
                event_name(&e.0)
            );
        }
    }

    /// Returns true if the observer has hung up.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn event_name(event: &ProxyEvent) -> &'static str {
    match event {
        ProxyEvent::InterceptRequest { .. } => "InterceptRequest",
        ProxyEvent::InterceptResponse { .. } => "InterceptResponse",
        ProxyEvent::HttpHistory(_) => "HttpHistory",
        ProxyEvent::InterceptStats(_) => "InterceptStats",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snare_core::InterceptStats;

    #[tokio::test]
    async fn emit_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel(4);
        sink.emit(ProxyEvent::InterceptStats(InterceptStats::default()))
            .await;
        sink.emit(ProxyEvent::InterceptRequest {
            id: "f1".into(),
            data: "GET / HTTP/1.1\r\n\r\n".into(),
        })
        .await;

        assert!(matches!(rx.recv().await, Some(ProxyEvent::InterceptStats(_))));
        assert_eq!(rx.recv().await.unwrap().flow_id(), Some("f1"));
    }

    #[tokio::test]
    async fn emit_after_observer_hangs_up_is_silent() {
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        assert!(sink.is_closed());
        sink.emit(ProxyEvent::InterceptStats(InterceptStats::default()))
            .await;
    }
}

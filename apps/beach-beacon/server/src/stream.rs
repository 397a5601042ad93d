use std::convert::Infallible;

use axum::{
    http::header,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use beach_beacon_core::{BroadcastHub, Connection, Frame, HEARTBEAT_COMMENT};
use futures_util::stream;
use metrics::{counter, gauge};
use tokio::sync::mpsc;

use crate::telemetry::names;

/// Releases a push connection when the HTTP response body is dropped, which
/// is how hyper reports that the client went away.
pub struct ConnectionGuard {
    hub: BroadcastHub,
    connection: Connection,
}

impl ConnectionGuard {
    pub fn new(hub: BroadcastHub, connection: Connection) -> Self {
        Self { hub, connection }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.hub.release(&self.connection) {
            counter!(names::CONNECTIONS_CLOSED, 1);
        }
        gauge!(names::CONNECTIONS_ACTIVE, self.hub.count() as f64);
    }
}

fn sse_event(frame: &Frame) -> Event {
    match frame {
        Frame::Event { name, data } => Event::default().event(*name).data(&**data),
        Frame::Heartbeat => Event::default().comment(HEARTBEAT_COMMENT),
    }
}

/// Event-stream response fed by the receive half of a connection's sink. The
/// body ends once the hub drops the sender (eviction, replacement, shutdown).
///
/// Heartbeats come from the hub, so axum's own keep-alive stays off.
pub fn event_stream(rx: mpsc::Receiver<Frame>, guard: ConnectionGuard) -> Response {
    let events = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let frame = rx.recv().await?;
        Some((Ok::<_, Infallible>(sse_event(&frame)), (rx, guard)))
    });

    (
        [
            (header::CONNECTION, "keep-alive"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Sse::new(events),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body;
    use beach_beacon_core::MatchMode;
    use time::OffsetDateTime;

    async fn render(frames: Vec<Frame>) -> String {
        let (tx, rx) = mpsc::channel(frames.len().max(1));
        for frame in frames {
            tx.try_send(frame).unwrap();
        }
        drop(tx);

        let hub = BroadcastHub::default();
        let (sink, _keep) = mpsc::channel::<Frame>(1);
        let connection = hub.register("guard", sink).unwrap();
        let response = event_stream(rx, ConnectionGuard::new(hub, connection));
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn frames_render_as_event_stream_records() {
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let hub = BroadcastHub::default();
        let event = hub.publish("https://x/y", MatchMode::Exact).unwrap();
        let refresh = Frame::refresh(&event).unwrap();
        let refresh_data = refresh.data().unwrap().to_string();

        let text = render(vec![
            Frame::connected("c1", at).unwrap(),
            Frame::heartbeat(),
            refresh,
        ])
        .await;

        assert_eq!(
            text,
            format!(
                "event: connected\ndata: {{\"clientId\":\"c1\",\"time\":\"2023-11-14T22:13:20Z\"}}\n\n\
                 : heartbeat\n\n\
                 event: refresh\ndata: {refresh_data}\n\n"
            )
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn response_carries_stream_headers() {
        let (_tx, rx) = mpsc::channel(1);
        let hub = BroadcastHub::default();
        let (sink, _keep) = mpsc::channel::<Frame>(1);
        let connection = hub.register("c1", sink).unwrap();
        let response = event_stream(rx, ConnectionGuard::new(hub, connection));

        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::CONNECTION], "keep-alive");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}

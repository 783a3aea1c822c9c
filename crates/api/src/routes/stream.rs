//! Live preview streams
//!
//! Each client gets one blocking worker running the preview loop. Encoded
//! frames reach the async side over a bounded channel. A frame that does not
//! fit because the client is behind is dropped, so a stalled client never
//! holds up a mode transition; a dropped receiver ends the stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use camera_control::{encode_jpeg, run_stream, FrameSink, ProcessedFrame, SinkError, StreamEnd};
use camera_driver::CameraDriver;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

use crate::AppState;

/// Multipart boundary between JPEG parts
pub const BOUNDARY: &str = "frame";

/// Sends each frame as one `multipart/x-mixed-replace` part
pub struct MjpegSink {
    tx: mpsc::Sender<Bytes>,
    quality: u8,
}

impl MjpegSink {
    pub fn new(tx: mpsc::Sender<Bytes>, quality: u8) -> Self {
        Self { tx, quality }
    }
}

impl FrameSink for MjpegSink {
    fn consume(&mut self, frame: &ProcessedFrame<'_>) -> Result<(), SinkError> {
        let jpeg = encode_jpeg(frame, self.quality)?;
        forward(&self.tx, multipart_part(&jpeg))
    }
}

/// Sends each frame as one binary message
pub struct MessageSink {
    tx: mpsc::Sender<Bytes>,
    quality: u8,
}

impl MessageSink {
    pub fn new(tx: mpsc::Sender<Bytes>, quality: u8) -> Self {
        Self { tx, quality }
    }
}

impl FrameSink for MessageSink {
    fn consume(&mut self, frame: &ProcessedFrame<'_>) -> Result<(), SinkError> {
        let jpeg = encode_jpeg(frame, self.quality)?;
        forward(&self.tx, Bytes::from(jpeg))
    }
}

fn forward(tx: &mpsc::Sender<Bytes>, payload: Bytes) -> Result<(), SinkError> {
    match tx.try_send(payload) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            trace!("Client behind, frame dropped");
            Ok(())
        }
        Err(TrySendError::Closed(_)) => Err(SinkError::Closed),
    }
}

/// `--frame` part header, the JPEG, and the trailing CRLF
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Run the preview loop for one client on a blocking worker
fn spawn_stream<D, S>(state: Arc<AppState<D>>, mut sink: S, client: &'static str)
where
    D: CameraDriver,
    S: FrameSink + Send + 'static,
{
    metrics::counter!("camera_stream_clients_total", "transport" => client).increment(1);
    tokio::task::spawn_blocking(move || {
        match run_stream(&state.session, &mut sink, &state.shutdown) {
            Ok(StreamEnd::Closed) => debug!("{} client disconnected", client),
            Ok(end) => info!("{} stream ended: {:?}", client, end),
            Err(e) => warn!("{} stream failed: {}", client, e),
        }
    });
}

/// GET /stream
pub async fn mjpeg<D: CameraDriver>(State(state): State<Arc<AppState<D>>>) -> Response {
    let (tx, rx) = mpsc::channel(state.stream_queue);
    let quality = state.session.settings().jpeg_quality;
    spawn_stream(state, MjpegSink::new(tx, quality), "MJPEG");

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
            ),
            (header::CACHE_CONTROL, "no-cache, no-store".to_string()),
        ],
        body,
    )
        .into_response()
}

/// GET /ws/stream
pub async fn websocket<D: CameraDriver>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<D>>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket<D: CameraDriver>(mut socket: WebSocket, state: Arc<AppState<D>>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(state.stream_queue);
    let quality = state.session.settings().jpeg_quality;
    spawn_stream(state, MessageSink::new(tx, quality), "WebSocket");

    while let Some(jpeg) = rx.recv().await {
        if socket.send(Message::Binary(jpeg.to_vec())).await.is_err() {
            break;
        }
    }
    // Dropping `rx` closes the sink if the socket went first.
    let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_control::{CameraSession, CameraSettings, StopSignal};
    use camera_driver::{MockBehavior, MockDriver};

    #[test]
    fn test_message_sink_sends_whole_jpegs() {
        let session = CameraSession::open(
            MockDriver::new(MockBehavior::mono(32, 24)),
            CameraSettings::default(),
        )
        .unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = MessageSink::new(tx, 60);
        let stop = StopSignal::new();

        std::thread::scope(|scope| {
            let stream = scope.spawn(|| run_stream(&session, &mut sink, &stop));

            for _ in 0..3 {
                let message = rx.blocking_recv().unwrap();
                assert!(message.starts_with(&[0xFF, 0xD8]));
                assert!(message.ends_with(&[0xFF, 0xD9]));
                let image = image::load_from_memory(&message).unwrap();
                // Preview runs at half resolution.
                assert_eq!((image.width(), image.height()), (16, 12));
            }

            // The client went away.
            drop(rx);
            assert_eq!(stream.join().unwrap().unwrap(), StreamEnd::Closed);
        });
        assert_eq!(session.in_flight(), 0);
        assert_eq!(session.driver().stats().outstanding, 0);
    }

    #[test]
    fn test_forward_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(forward(&tx, Bytes::from_static(b"a")).is_ok());
        assert!(forward(&tx, Bytes::from_static(b"b")).is_ok());
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(matches!(forward(&tx, Bytes::from_static(b"c")), Err(SinkError::Closed)));
    }

    #[test]
    fn test_multipart_part_layout() {
        let part = multipart_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with(
            "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n"
        ));
        assert!(part.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }
}

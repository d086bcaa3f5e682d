//! # Upstream Realtime Connection
//!
//! Opens the websocket to the conversational endpoint on behalf of one
//! session and splits it into two background tasks:
//! - a **writer** draining an unbounded channel into the socket
//! - a **reader** decoding frames into [`UpstreamEvent`]s
//!
//! The session holds an [`UpstreamHandle`] (the writer side) and the actor
//! consumes the event stream. Dropping the handle ends the writer, which
//! closes the socket.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::event::RealtimeEvent;
use crate::relay::session::UpstreamLink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::uri::PathAndQuery;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Uri};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Something the upstream sent, or the end of it.
#[derive(Debug)]
pub enum UpstreamEvent {
    Server(RealtimeEvent),
    Malformed(RelayError),
    Closed(Option<String>),
}

fn invalid_url(e: impl std::fmt::Display) -> RelayError {
    RelayError::UpstreamConnect(format!("invalid upstream url: {}", e))
}

/// Builds and opens upstream connections. Cheap to clone, one per process.
#[derive(Debug, Clone)]
pub struct RealtimeConnector {
    url: String,
    model: String,
    api_key: String,
    connect_timeout: Duration,
}

impl RealtimeConnector {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            api_key: api_key.into(),
            connect_timeout,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            config.upstream_url.clone(),
            config.model.clone(),
            config.api_key.clone(),
            Duration::from_millis(config.connect_timeout_ms),
        )
    }

    /// Upstream URL with the model selected in the query string. A URL with
    /// no path targets `/`.
    pub fn endpoint(&self) -> Result<Uri, RelayError> {
        let uri: Uri = self.url.parse().map_err(invalid_url)?;
        let path = match uri.path() {
            "" => "/",
            path => path,
        };
        let path_and_query = match uri.query() {
            Some(query) => format!("{}?{}&model={}", path, query, self.model),
            None => format!("{}?model={}", path, self.model),
        };

        let mut parts = uri.into_parts();
        parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).map_err(invalid_url)?);
        Uri::from_parts(parts).map_err(invalid_url)
    }

    /// Handshake request with the auth and beta headers.
    pub fn build_request(&self) -> Result<Request, RelayError> {
        let mut request = self
            .endpoint()?
            .into_client_request()
            .map_err(invalid_url)?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| RelayError::UpstreamConnect(format!("invalid api key: {}", e)))?;

        let headers = request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        Ok(request)
    }

    /// Open the connection, bounded by the connect timeout.
    pub async fn connect(&self) -> Result<UpstreamConnection, RelayError> {
        let request = self.build_request()?;
        let key_hint: String = self.api_key.chars().take(3).collect();
        debug!(endpoint = %request.uri(), key = %format!("{}...", key_hint), "Connecting upstream");

        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| RelayError::ConnectTimeout(self.connect_timeout.as_millis() as u64))?
            .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;

        let (mut sink, mut source) = stream.split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<UpstreamEvent>();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(message) = write_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!("Upstream write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_connected = connected.clone();
        tokio::spawn(async move {
            let mut reason = None;

            while let Some(frame) = source.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => match RealtimeEvent::parse(text) {
                        Ok(event) => UpstreamEvent::Server(event),
                        Err(err) => UpstreamEvent::Malformed(err),
                    },
                    Ok(Message::Binary(data)) => UpstreamEvent::Malformed(RelayError::MalformedFrame(format!(
                        "unexpected {} byte binary frame",
                        data.len()
                    ))),
                    Ok(Message::Close(frame)) => {
                        reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        reason = Some(e.to_string());
                        break;
                    }
                };

                if event_tx.send(event).is_err() {
                    // Session is gone
                    break;
                }
            }

            reader_connected.store(false, Ordering::Release);
            let _ = event_tx.send(UpstreamEvent::Closed(reason));
        });

        info!(model = %self.model, "Upstream websocket open");

        Ok(UpstreamConnection {
            handle: UpstreamHandle { write_tx, connected },
            events: UnboundedReceiverStream::new(event_rx),
        })
    }
}

/// A freshly opened upstream: the send handle plus everything it will emit.
pub struct UpstreamConnection {
    pub handle: UpstreamHandle,
    pub events: UnboundedReceiverStream<UpstreamEvent>,
}

/// Sending side of an upstream connection.
#[derive(Debug)]
pub struct UpstreamHandle {
    write_tx: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
}

impl UpstreamLink for UpstreamHandle {
    fn send(&mut self, event: &RealtimeEvent) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::UpstreamSend("upstream is disconnected".to_string()));
        }
        self.write_tx
            .send(Message::Text(event.raw().to_string()))
            .map_err(|_| RelayError::UpstreamSend("upstream writer has exited".to_string()))
    }

    fn disconnect(&mut self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.write_tx.send(Message::Close(None));
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.write_tx.is_closed()
    }
}

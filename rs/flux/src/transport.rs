//! The WebSocket transport.
//!
//! Every binary message is one chunk of the byte stream. Text messages carry nothing we use.
use anyhow::Context;
use bytes::Bytes;
use futures::{Stream, StreamExt, future, stream::BoxStream};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Connect to a `ws://` or `wss://` URL, returning the stream of binary chunks.
///
/// The stream ends when the peer closes the connection.
pub async fn connect(url: &Url) -> anyhow::Result<BoxStream<'static, anyhow::Result<Bytes>>> {
	tracing::debug!(%url, "connecting");

	let (socket, response) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.with_context(|| format!("failed to connect to {url}"))?;

	tracing::info!(%url, status = %response.status(), "connected");

	Ok(chunks(socket).boxed())
}

/// Turn WebSocket messages into chunks.
pub fn chunks<S, E>(messages: S) -> impl Stream<Item = anyhow::Result<Bytes>>
where
	S: Stream<Item = Result<Message, E>>,
	E: Into<anyhow::Error>,
{
	messages
		.take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
		.filter_map(|message| {
			future::ready(match message {
				Ok(Message::Binary(data)) => Some(Ok(data)),
				Ok(Message::Text(text)) => {
					tracing::trace!(size = text.len(), "ignoring text message");
					None
				}
				Ok(_) => None,
				Err(err) => Some(Err(err.into())),
			})
		})
}

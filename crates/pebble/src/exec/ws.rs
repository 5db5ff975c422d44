//! Websocket framing helpers for exec streams.
//!
//! Data streams (stdio, stderr) carry raw bytes as binary frames. The
//! control stream carries JSON text frames. A close code other than 1000
//! from the client is reported as abnormal so the caller can kill the child.

use std::io;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) type WsSink = SplitSink<WebSocket, Message>;
pub(crate) type WsStream = SplitStream<WebSocket>;

const CHUNK_SIZE: usize = 8192;

fn ws_err(e: axum::Error) -> io::Error {
	io::Error::other(e)
}

/// Copies `src` into binary frames until end of stream (or `limit` bytes),
/// then sends a normal close. Frame order matches read order; there is
/// exactly one sender per stream.
pub(crate) async fn send_stream<R>(
	ws: &mut WsSink,
	src: R,
	limit: Option<u64>,
) -> io::Result<()>
where
	R: AsyncRead + Unpin,
{
	match limit {
		Some(limit) => copy_frames(ws, src.take(limit)).await?,
		None => copy_frames(ws, src).await?,
	}
	let _ = ws
		.send(Message::Close(Some(CloseFrame {
			code: close_code::NORMAL,
			reason: "".into(),
		})))
		.await;
	Ok(())
}

async fn copy_frames<R>(ws: &mut WsSink, mut src: R) -> io::Result<()>
where
	R: AsyncRead + Unpin,
{
	let mut buf = vec![0u8; CHUNK_SIZE];
	loop {
		let n = src.read(&mut buf).await?;
		if n == 0 {
			return Ok(());
		}
		ws
			.send(Message::Binary(Bytes::copy_from_slice(&buf[..n])))
			.await
			.map_err(ws_err)?;
	}
}

/// Pumps binary frames into `dst` until the client signals end of input.
///
/// Stdin EOF arrives as an empty text frame, since a websocket close would
/// tear down the whole duplex channel while output may still be flowing the
/// other way. A close (or error) also ends the stream. The writer is owned
/// and dropped on return, so a pipe-backed child stdin observes EOF.
pub(crate) async fn recv_stream<W>(ws: &mut WsStream, mut dst: W) -> io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	while let Some(msg) = ws.next().await {
		match msg {
			Ok(Message::Binary(data)) => dst.write_all(&data).await?,
			Ok(Message::Text(text)) if text.is_empty() => break,
			Ok(Message::Close(_)) | Err(_) => break,
			Ok(_) => {},
		}
	}
	dst.shutdown().await?;
	Ok(())
}

/// Interactive-terminal variant of [`recv_stream`]: when the client ends
/// stdin, the tty EOF character goes into the PTY master instead of a close.
/// Closing the master here would truncate output the mirror has not read yet.
pub(crate) async fn recv_stream_tty<W>(
	ws: &mut WsStream,
	mut dst: W,
	eof_char: u8,
) -> io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	while let Some(msg) = ws.next().await {
		match msg {
			Ok(Message::Binary(data)) => dst.write_all(&data).await?,
			Ok(Message::Text(text)) if text.is_empty() => break,
			Ok(Message::Close(_)) | Err(_) => break,
			Ok(_) => {},
		}
	}
	dst.write_all(&[eof_char]).await?;
	dst.flush().await?;
	Ok(())
}

/// Discards client frames on a write-only stream (stderr) until close.
pub(crate) async fn drain(ws: &mut WsStream) {
	while let Some(msg) = ws.next().await {
		match msg {
			Ok(Message::Close(_)) | Err(_) => break,
			Ok(_) => {},
		}
	}
}

/// A control-channel message.
///
/// `{"command":"resize","resize":{"width":80,"height":24}}`
/// `{"command":"signal","signal":{"name":"SIGTERM"}}`
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ControlMessage {
	pub command: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resize: Option<ResizeArgs>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub signal: Option<SignalArgs>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ResizeArgs {
	pub width: u16,
	pub height: u16,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct SignalArgs {
	pub name: String,
}

/// What the control loop saw from the websocket.
pub(crate) enum ControlEvent {
	Message(ControlMessage),
	/// Peer closed with code 1000.
	ClosedNormally,
	/// Peer closed with any other code, or the stream errored out.
	ClosedAbnormally,
}

/// Reads the next control event. Malformed JSON is logged and skipped; it
/// does not terminate the stream.
pub(crate) async fn next_control_event(ws: &mut WsStream) -> ControlEvent {
	loop {
		match ws.next().await {
			Some(Ok(Message::Text(text))) => match serde_json::from_str(text.as_str()) {
				Ok(msg) => return ControlEvent::Message(msg),
				Err(e) => {
					tracing::warn!("ignoring malformed control message: {e}");
				},
			},
			Some(Ok(Message::Close(frame))) => {
				let normal = frame
					.as_ref()
					.map(|f| f.code == close_code::NORMAL)
					.unwrap_or(true);
				return if normal {
					ControlEvent::ClosedNormally
				} else {
					ControlEvent::ClosedAbnormally
				};
			},
			Some(Ok(_)) => {},
			Some(Err(_)) | None => return ControlEvent::ClosedAbnormally,
		}
	}
}

//! Adapter from axum's websocket type to the tungstenite message stream the
//! station pumps are written against.
//!
//! A station session is the same state machine whether this process dialled
//! the peer (tungstenite) or accepted it (axum upgrade); this keeps one
//! implementation by converting axum's mirror-image `Message` on the way
//! through.

use axum::extract::ws::{self, WebSocket};
use futures_util::{Sink, Stream};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// An accepted websocket speaking tungstenite messages.
pub struct AxumWs {
    inner: WebSocket,
}

impl AxumWs {
    pub fn new(inner: WebSocket) -> AxumWs {
        AxumWs { inner }
    }
}

fn into_tungstenite(msg: ws::Message) -> Message {
    match msg {
        ws::Message::Text(t) => Message::Text(t.as_str().into()),
        ws::Message::Binary(b) => Message::Binary(b),
        ws::Message::Ping(p) => Message::Ping(p),
        ws::Message::Pong(p) => Message::Pong(p),
        ws::Message::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().into(),
        })),
    }
}

/// Raw frames never leave tungstenite's internals, so the conversion back
/// is only partial in theory, never in practice.
fn into_axum(msg: Message) -> Option<ws::Message> {
    match msg {
        Message::Text(t) => Some(ws::Message::Text(t.as_str().into())),
        Message::Binary(b) => Some(ws::Message::Binary(b)),
        Message::Ping(p) => Some(ws::Message::Ping(p)),
        Message::Pong(p) => Some(ws::Message::Pong(p)),
        Message::Close(frame) => Some(ws::Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        }))),
        Message::Frame(_) => None,
    }
}

fn into_ws_error(e: axum::Error) -> WsError {
    WsError::Io(std::io::Error::other(e))
}

impl Stream for AxumWs {
    type Item = Result<Message, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(msg))) => Poll::Ready(Some(Ok(into_tungstenite(msg)))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(into_ws_error(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Sink<Message> for AxumWs {
    type Error = WsError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(into_ws_error)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
        match into_axum(item) {
            Some(msg) => Pin::new(&mut self.inner)
                .start_send(msg)
                .map_err(into_ws_error),
            None => Ok(()),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(into_ws_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(into_ws_error)
    }
}

//! Job notification streaming.
//!
//! An [`EventListener`] owns a subscribed connection and yields the
//! notifications of its job in emission order. The stream ends after the
//! job's terminal event, or when the supervisor closes the connection.

use futures::{Stream, StreamExt};
use procgov_common::error::{ProcgovError, Result};
use procgov_ipc::codec::WireCodec;
use procgov_ipc::protocol::{Notification, ServerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// Listens for the notifications of one job.
#[derive(Debug)]
pub struct EventListener<S> {
    job: String,
    framed: Framed<S, WireCodec<ServerMessage>>,
    finished: bool,
}

impl<S> EventListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) const fn new(job: String, framed: Framed<S, WireCodec<ServerMessage>>) -> Self {
        Self {
            job,
            framed,
            finished: false,
        }
    }

    /// Name of the job this listener is subscribed to.
    #[must_use]
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Waits for the next notification.
    ///
    /// Returns `None` once the terminal event was delivered or the
    /// supervisor closed the connection.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the supervisor sends a response on the
    /// subscribed connection, or the transport error that broke it.
    pub async fn next(&mut self) -> Result<Option<Notification>> {
        if self.finished {
            return Ok(None);
        }
        match self.framed.next().await {
            Some(Ok(ServerMessage::Notification(event))) => {
                self.finished = event.is_terminal();
                Ok(Some(event))
            }
            Some(Ok(ServerMessage::Response(response))) => {
                self.finished = true;
                Err(ProcgovError::protocol(format!(
                    "response {response:?} on a subscribed connection"
                )))
            }
            Some(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            None => {
                tracing::debug!(job = %self.job, "supervisor closed the subscription");
                self.finished = true;
                Ok(None)
            }
        }
    }

    /// Converts the listener into a [`Stream`] of notifications.
    pub fn into_stream(self) -> impl Stream<Item = Result<Notification>> {
        futures::stream::unfold(self, |mut listener| async move {
            listener
                .next()
                .await
                .transpose()
                .map(|item| (item, listener))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::io::DuplexStream;

    fn listener() -> (
        EventListener<DuplexStream>,
        Framed<DuplexStream, WireCodec<ServerMessage>>,
    ) {
        let (client, server) = tokio::io::duplex(4096);
        (
            EventListener::new("j".into(), Framed::new(client, WireCodec::new())),
            Framed::new(server, WireCodec::new()),
        )
    }

    fn new_process(pid: u32) -> ServerMessage {
        Notification::NewProcess {
            name: "j".into(),
            pid,
        }
        .into()
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_event() {
        let (listener, mut server) = listener();
        server.send(new_process(1)).await.unwrap();
        server
            .send(ServerMessage::from(Notification::NoActiveProcesses { name: "j".into() }))
            .await
            .unwrap();
        server.send(new_process(2)).await.unwrap();

        let events: Vec<Notification> = listener
            .into_stream()
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn closed_connection_ends_the_stream() {
        let (mut listener, mut server) = listener();
        server.send(new_process(1)).await.unwrap();
        drop(server);
        assert!(listener.next().await.unwrap().is_some());
        assert!(listener.next().await.unwrap().is_none());
        assert!(listener.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn response_on_subscription_is_a_protocol_error() {
        let (mut listener, mut server) = listener();
        server
            .send(ServerMessage::from(
                procgov_ipc::protocol::Response::GetJobName {
                    name: String::new(),
                },
            ))
            .await
            .unwrap();
        assert!(matches!(
            listener.next().await,
            Err(ProcgovError::Protocol { .. })
        ));
        assert!(listener.next().await.unwrap().is_none());
    }
}

//! Request/response client for the supervisor socket.
//!
//! A connection carries one outstanding request at a time. Subscribing to
//! a job turns the connection into an [`EventListener`]; no further
//! requests can be sent on it afterwards.

use std::io;
use std::path::Path;

use futures::{SinkExt, StreamExt};
use procgov_common::error::{ProcgovError, Result};
use procgov_common::types::JobSettings;
use procgov_ipc::codec::WireCodec;
use procgov_ipc::endpoint;
use procgov_ipc::protocol::{Request, Response, ServerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::event::EventListener;

/// Client side of one supervisor connection.
#[derive(Debug)]
pub struct GatewayClient<S = UnixStream> {
    framed: Framed<S, WireCodec<ServerMessage>>,
}

impl GatewayClient<UnixStream> {
    /// Connects to the supervisor listening on `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::Transport`] if no supervisor listens there.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = endpoint::connect(path).await?;
        tracing::debug!(path = %path.display(), "connected to supervisor");
        Ok(Self::new(stream))
    }
}

impl<S> GatewayClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an established stream.
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, WireCodec::new()),
        }
    }

    /// Creates job `name` or merges `settings` onto it. Returns the
    /// resolved name, which is generated by the supervisor when `name` is
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns [`ProcgovError::Rejected`] if the supervisor could not apply
    /// the settings, or a transport/protocol error.
    pub async fn monitor_job(&mut self, name: &str, settings: &JobSettings) -> Result<String> {
        self.send_monitor(name, settings, false).await
    }

    /// Like [`monitor_job`](Self::monitor_job), then turns the connection
    /// into a listener for the job's notifications.
    ///
    /// # Errors
    ///
    /// Same as [`monitor_job`](Self::monitor_job).
    pub async fn subscribe(
        mut self,
        name: &str,
        settings: &JobSettings,
    ) -> Result<EventListener<S>> {
        let name = self.send_monitor(name, settings, true).await?;
        tracing::debug!(job = %name, "subscribed");
        Ok(EventListener::new(name, self.framed))
    }

    /// Name of the job `pid` runs in, if the supervisor tracks it.
    ///
    /// # Errors
    ///
    /// Returns a transport or protocol error.
    pub async fn get_job_name(&mut self, pid: u32) -> Result<Option<String>> {
        match self.call(Request::GetJobName { pid }).await? {
            Response::GetJobName { name } => Ok(Some(name).filter(|n| !n.is_empty())),
            other => Err(unexpected("GetJobName", &other)),
        }
    }

    /// Stored settings of job `name`, if the supervisor knows it.
    ///
    /// # Errors
    ///
    /// Returns a transport or protocol error.
    pub async fn get_job_settings(&mut self, name: &str) -> Result<Option<JobSettings>> {
        let request = Request::GetJobSettings {
            name: name.to_owned(),
        };
        match self.call(request).await? {
            Response::GetJobSettings { name, settings } => {
                Ok((!name.is_empty()).then_some(settings))
            }
            other => Err(unexpected("GetJobSettings", &other)),
        }
    }

    async fn send_monitor(
        &mut self,
        name: &str,
        settings: &JobSettings,
        subscribe: bool,
    ) -> Result<String> {
        let request = Request::MonitorJob {
            name: name.to_owned(),
            subscribe,
            settings: settings.clone(),
        };
        match self.call(request).await? {
            Response::MonitorJob { name } => Ok(name),
            other => Err(unexpected("MonitorJob", &other)),
        }
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        self.framed.send(request).await?;
        match self.framed.next().await {
            Some(Ok(ServerMessage::Response(Response::Error { message }))) => {
                Err(ProcgovError::Rejected { message })
            }
            Some(Ok(ServerMessage::Response(response))) => Ok(response),
            Some(Ok(ServerMessage::Notification(event))) => Err(ProcgovError::protocol(format!(
                "notification '{event}' on a request connection"
            ))),
            Some(Err(e)) => Err(e),
            None => Err(ProcgovError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "supervisor closed the connection",
            ))),
        }
    }
}

fn unexpected(request: &str, response: &Response) -> ProcgovError {
    ProcgovError::protocol(format!("unexpected response to {request}: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use procgov_ipc::protocol::Notification;
    use tokio::io::DuplexStream;

    type Server = Framed<DuplexStream, WireCodec<Request>>;

    fn pair() -> (GatewayClient<DuplexStream>, Server) {
        let (client, server) = tokio::io::duplex(4096);
        (GatewayClient::new(client), Framed::new(server, WireCodec::new()))
    }

    async fn reply(server: &mut Server, message: impl Into<ServerMessage>) -> Request {
        let request = server.next().await.unwrap().unwrap();
        server.send(message.into()).await.unwrap();
        request
    }

    #[tokio::test]
    async fn empty_job_name_means_untracked() {
        let (mut client, mut server) = pair();
        let answer = tokio::spawn(async move {
            reply(&mut server, Response::GetJobName { name: String::new() }).await
        });
        assert_eq!(client.get_job_name(7).await.unwrap(), None);
        assert_eq!(answer.await.unwrap(), Request::GetJobName { pid: 7 });
    }

    #[tokio::test]
    async fn unknown_settings_are_none() {
        let (mut client, mut server) = pair();
        let _answer = tokio::spawn(async move {
            reply(
                &mut server,
                Response::GetJobSettings {
                    name: String::new(),
                    settings: JobSettings::default(),
                },
            )
            .await
        });
        assert!(client.get_job_settings("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_response_is_rejected() {
        let (mut client, mut server) = pair();
        let _answer = tokio::spawn(async move {
            reply(
                &mut server,
                Response::Error {
                    message: "set information job object failed".into(),
                },
            )
            .await
        });
        let err = client
            .monitor_job("j", &JobSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcgovError::Rejected { .. }));
    }

    #[tokio::test]
    async fn notification_before_response_is_a_protocol_error() {
        let (mut client, mut server) = pair();
        let _answer = tokio::spawn(async move {
            reply(&mut server, Notification::NoActiveProcesses { name: "j".into() }).await
        });
        let err = client.get_job_name(1).await.unwrap_err();
        assert!(matches!(err, ProcgovError::Protocol { .. }));
    }

    #[tokio::test]
    async fn closed_connection_is_a_transport_error() {
        let (mut client, server) = pair();
        drop(server);
        let err = client.get_job_name(1).await.unwrap_err();
        assert!(err.is_connection_scoped());
    }
}

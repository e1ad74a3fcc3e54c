use std::time::Duration;

use async_trait::async_trait;
use cmdrunner_core::{CmdRunnerError, JobTransport, Result};
use reqwest::{Client, StatusCode};
use tracing::debug;

/// Extra time allowed on top of the long-poll wait before a request is
/// considered hung.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

/// [`JobTransport`] backed by the server's broker endpoints.
///
/// `receive` long-polls until a message shows up; it never reports the
/// transport as closed, so a worker keeps retrying across server restarts.
pub struct HttpTransport {
    client: Client,
    server: String,
    poll_wait: Duration,
}

impl HttpTransport {
    pub fn new(client: Client, server: impl Into<String>, poll_wait: Duration) -> Self {
        Self {
            client,
            server: server.into().trim_end_matches('/').to_string(),
            poll_wait,
        }
    }

    fn queue_url(&self, queue: &str, action: &str) -> String {
        format!("{}/api/v1/queues/{}/{}", self.server, queue, action)
    }
}

async fn unexpected_status(response: reqwest::Response) -> CmdRunnerError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    CmdRunnerError::Transport(format!("broker returned {}: {}", status, text))
}

#[async_trait]
impl JobTransport for HttpTransport {
    async fn declare_queue(&self, _queue: &str) -> Result<()> {
        // The server declares queues on first use.
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(self.queue_url(queue, "messages"))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| CmdRunnerError::NetworkError(format!("Failed to publish: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(unexpected_status(response).await)
        }
    }

    async fn receive(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let wait_ms = self.poll_wait.as_millis().to_string();
        loop {
            let response = self
                .client
                .post(self.queue_url(queue, "receive"))
                .query(&[("wait_ms", wait_ms.as_str())])
                .timeout(self.poll_wait + REQUEST_SLACK)
                .send()
                .await
                .map_err(|e| CmdRunnerError::NetworkError(format!("Failed to receive: {}", e)))?;

            match response.status() {
                StatusCode::OK => {
                    let body = response.bytes().await.map_err(|e| {
                        CmdRunnerError::NetworkError(format!("Failed to read message: {}", e))
                    })?;
                    return Ok(Some(body.to_vec()));
                }
                StatusCode::NO_CONTENT => {
                    debug!(queue, "no message within poll window");
                }
                StatusCode::GONE => {
                    return Err(CmdRunnerError::Transport(
                        "broker is shutting down".to_string(),
                    ));
                }
                _ => return Err(unexpected_status(response).await),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn create_test_transport(server: &mockito::Server) -> HttpTransport {
        HttpTransport::new(Client::new(), server.url(), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_publish_posts_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/queues/cmd/messages")
            .match_body(r#"{"executable":"echo","argument":""}"#)
            .with_status(200)
            .create_async()
            .await;

        let transport = create_test_transport(&server);
        transport
            .publish("cmd", br#"{"executable":"echo","argument":""}"#.to_vec())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_publish_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/queues/cmd/messages")
            .with_status(503)
            .with_body(r#"{"error":"transport is closed"}"#)
            .create_async()
            .await;

        let err = create_test_transport(&server)
            .publish("cmd", b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, CmdRunnerError::Transport(_)));
    }

    #[tokio::test]
    async fn test_receive_returns_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/queues/cmd/receive")
            .match_query(Matcher::UrlEncoded("wait_ms".into(), "100".into()))
            .with_status(200)
            .with_body(r#"{"executable":"date","argument":""}"#)
            .create_async()
            .await;

        let body = create_test_transport(&server).receive("cmd").await.unwrap();
        assert_eq!(body, Some(br#"{"executable":"date","argument":""}"#.to_vec()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_receive_polls_again_after_empty_window() {
        let mut server = mockito::Server::new_async().await;
        let empty = server
            .mock("POST", "/api/v1/queues/cmd/receive")
            .match_query(Matcher::Any)
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        let delivered = server
            .mock("POST", "/api/v1/queues/cmd/receive")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"executable":"uptime","argument":""}"#)
            .expect(1)
            .create_async()
            .await;

        let body = create_test_transport(&server).receive("cmd").await.unwrap();
        assert_eq!(body, Some(br#"{"executable":"uptime","argument":""}"#.to_vec()));
        empty.assert_async().await;
        delivered.assert_async().await;
    }

    #[tokio::test]
    async fn test_receive_gone_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/queues/cmd/receive")
            .match_query(Matcher::Any)
            .with_status(410)
            .create_async()
            .await;

        let err = create_test_transport(&server).receive("cmd").await.unwrap_err();
        assert!(matches!(err, CmdRunnerError::Transport(_)));
    }

    #[tokio::test]
    async fn test_receive_unreachable_server() {
        let transport = HttpTransport::new(
            Client::new(),
            "http://127.0.0.1:1",
            Duration::from_millis(100),
        );
        let err = transport.receive("cmd").await.unwrap_err();
        assert!(matches!(err, CmdRunnerError::NetworkError(_)));
    }
}

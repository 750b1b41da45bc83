//! TCP probe (spec.md §4.1): connect-and-close, `success ⇔ connect returned`.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::common::error::ErrorKind;

#[derive(Debug, Clone)]
pub struct TcpProbeResult {
    pub success: bool,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

pub async fn run(host: &str, port: u16, connect_timeout: Duration) -> TcpProbeResult {
    let started = Instant::now();
    let addr = format!("{host}:{port}");

    match timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            TcpProbeResult {
                success: true,
                duration_ms: started.elapsed().as_millis() as i64,
                error: None,
                error_kind: None,
            }
        }
        Ok(Err(e)) => TcpProbeResult {
            success: false,
            duration_ms: started.elapsed().as_millis() as i64,
            error: Some(e.to_string()),
            error_kind: Some(ErrorKind::TcpError),
        },
        Err(_) => TcpProbeResult {
            success: false,
            duration_ms: started.elapsed().as_millis() as i64,
            error: Some("connection timed out".to_string()),
            error_kind: Some(ErrorKind::Timeout),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn success_on_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let result = run("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn failure_on_closed_port() {
        // Port 1 is privileged and almost certainly not listening in test envs.
        let result = run("127.0.0.1", 1, Duration::from_millis(500)).await;
        assert!(!result.success);
    }
}

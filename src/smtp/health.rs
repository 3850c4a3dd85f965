//! Liveness probe: a healthy relay greets with `220`.

use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Connect to `host:port`, read the greeting and check it is a 220.
///
/// Returns the banner on success.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> anyhow::Result<String> {
    let banner = tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("connect to {host}:{port}"))?;
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.context("read banner")?;
        anyhow::Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    })
    .await
    .context("timed out waiting for banner")??;

    if banner.starts_with("220") {
        Ok(banner)
    } else {
        anyhow::bail!("unexpected banner - {}", banner.trim_end())
    }
}

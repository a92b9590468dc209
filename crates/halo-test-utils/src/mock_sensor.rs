use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Build a wire message from an identifier, display name and `key=value` pairs.
pub fn heartbeat_line(mac: &str, name: &str, fields: &[(&str, &str)]) -> String {
    let pairs: Vec<String> = fields.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{},{},{}", mac, name, pairs.join(","))
}

/// A fake sensor that connects to the ingest listener and writes raw bytes.
///
/// Nothing is ever read back; the protocol has no acknowledgements.
pub struct MockSensor {
    stream: TcpStream,
}

impl MockSensor {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(MockSensor { stream })
    }

    /// Send one message followed by `\n`.
    pub async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await
    }

    /// Send bytes exactly as given, without adding a terminator.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Half-close the write side so the server sees EOF.
    pub async fn close(mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

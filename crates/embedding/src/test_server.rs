//! Minimal scripted HTTP/1.1 responder for transport-level tests.
//!
//! Each accepted connection consumes the next scripted response, so tests can
//! exercise sequences like 429-then-200 deterministically without a real
//! endpoint.

use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::{TcpListener, TcpStream},
};

pub struct ScriptedServer {
  addr: std::net::SocketAddr,
  hits: Arc<AtomicUsize>,
}

impl ScriptedServer {
  pub async fn spawn(responses: Vec<String>) -> Self {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let hit_counter = hits.clone();

    tokio::spawn(async move {
      let mut remaining = responses.into_iter();
      loop {
        let Ok((mut socket, _)) = listener.accept().await else {
          break;
        };
        if read_request(&mut socket).await.is_err() {
          continue;
        }
        hit_counter.fetch_add(1, Ordering::SeqCst);
        let response = remaining
          .next()
          .unwrap_or_else(|| status_response(500, "script exhausted"));
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
      }
    });

    Self { addr, hits }
  }

  pub fn url(&self, path: &str) -> String {
    format!("http://{}{}", self.addr, path)
  }

  pub fn hits(&self) -> usize {
    self.hits.load(Ordering::SeqCst)
  }
}

/// Drain one request: headers, then Content-Length bytes of body.
async fn read_request(socket: &mut TcpStream) -> std::io::Result<()> {
  let mut buf = Vec::new();
  let mut chunk = [0u8; 1024];

  let header_end = loop {
    let n = socket.read(&mut chunk).await?;
    if n == 0 {
      return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    buf.extend_from_slice(&chunk[..n]);
    if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
      break pos + 4;
    }
  };

  let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
  let content_length = headers
    .lines()
    .find_map(|l| l.strip_prefix("content-length:"))
    .and_then(|v| v.trim().parse::<usize>().ok())
    .unwrap_or(0);

  while buf.len() < header_end + content_length {
    let n = socket.read(&mut chunk).await?;
    if n == 0 {
      break;
    }
    buf.extend_from_slice(&chunk[..n]);
  }

  Ok(())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack.windows(needle.len()).position(|window| window == needle)
}

pub fn json_response(code: u16, body: &str) -> String {
  format!(
    "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    code,
    body.len(),
    body
  )
}

pub fn status_response(code: u16, body: &str) -> String {
  format!(
    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    code,
    body.len(),
    body
  )
}

//! REST side of the network client.

mod client;
mod link;
mod types;

pub use client::{ApiClient, SUBDOMAIN_HEADER};
pub use link::{parse_link_header, Links};
pub use types::{decode_page, page_records, ApiResponse};

/// Minimal HTTP/1.1 responder for client tests.
#[cfg(test)]
pub(crate) mod test_server {
  use std::net::SocketAddr;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, TcpStream};
  use tokio::task::JoinHandle;

  pub struct TestServer {
    listener: TcpListener,
    addr: SocketAddr,
  }

  impl TestServer {
    pub async fn bind() -> Self {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      let addr = listener.local_addr().unwrap();
      Self { listener, addr }
    }

    pub fn url(&self) -> String {
      format!("http://{}", self.addr)
    }

    /// Answer one connection per canned response, in order. Resolves to the
    /// raw requests received.
    pub fn serve(self, responses: Vec<String>) -> JoinHandle<Vec<String>> {
      tokio::spawn(async move {
        let mut seen = Vec::new();
        for response in responses {
          let (mut stream, _) = self.listener.accept().await.unwrap();
          seen.push(read_request(&mut stream).await);
          stream.write_all(response.as_bytes()).await.unwrap();
          stream.shutdown().await.ok();
        }
        seen
      })
    }
  }

  async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
      let n = stream.read(&mut chunk).await.unwrap();
      if n == 0 {
        break;
      }
      buf.extend_from_slice(&chunk[..n]);

      let text = String::from_utf8_lossy(&buf);
      if let Some(head_end) = text.find("\r\n\r\n") {
        let content_length = text[..head_end]
          .lines()
          .filter_map(|line| line.split_once(':'))
          .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
          .and_then(|(_, value)| value.trim().parse::<usize>().ok())
          .unwrap_or(0);
        if buf.len() >= head_end + 4 + content_length {
          break;
        }
      }
    }
    String::from_utf8_lossy(&buf).into_owned()
  }

  pub fn http_response(status: u16, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!("HTTP/1.1 {} TEST\r\n", status);
    for (name, value) in headers {
      out.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !body.is_empty() {
      out.push_str("Content-Type: application/json\r\n");
    }
    out.push_str(&format!(
      "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
      body.len(),
      body
    ));
    out
  }
}

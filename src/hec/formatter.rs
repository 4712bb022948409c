//! Composes the HTTP/1.1 POST request framing for a Splunk HEC endpoint.
//!
//! The request template is reproduced byte-for-byte from the original
//! collector's `hec_header` (CRLF line endings, fixed header order, no
//! trailing body separator):
//!
//! ```text
//! POST /services/collector HTTP/1.1\r\n
//! Host: <host>:<port>\r\n
//! User-Agent: freeflow\r\n
//! Connection: keep-alive\r\n
//! Authorization: Splunk <token>\r\n
//! Content-Length: <N>\r\n
//! \r\n
//! <body>
//! ```

use crate::config::HecEndpoint;

/// Build the full HTTP/1.1 POST request (header block + body) for the given
/// endpoint and body. An empty `body` produces the zero-length probe
/// request used by the connectivity check.
#[must_use]
pub fn build_request(endpoint: &HecEndpoint, body: &str) -> Vec<u8> {
    let header = format!(
        "POST /services/collector HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         User-Agent: freeflow\r\n\
         Connection: keep-alive\r\n\
         Authorization: Splunk {token}\r\n\
         Content-Length: {len}\r\n\
         \r\n",
        host = endpoint.host,
        port = endpoint.port,
        token = endpoint.token,
        len = body.len(),
    );

    let mut request = Vec::with_capacity(header.len() + body.len());
    request.extend_from_slice(header.as_bytes());
    request.extend_from_slice(body.as_bytes());
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> HecEndpoint {
        HecEndpoint {
            host: "splunk.example.com".to_string(),
            port: 8088,
            token: "deadbeef".to_string(),
        }
    }

    #[test]
    fn builds_exact_probe_request() {
        let request = build_request(&endpoint(), "");
        let text = String::from_utf8(request).unwrap();
        assert_eq!(
            text,
            "POST /services/collector HTTP/1.1\r\n\
             Host: splunk.example.com:8088\r\n\
             User-Agent: freeflow\r\n\
             Connection: keep-alive\r\n\
             Authorization: Splunk deadbeef\r\n\
             Content-Length: 0\r\n\
             \r\n"
        );
    }

    #[test]
    fn content_length_matches_body_byte_length() {
        let body = "{\"event\": \"x\"}".repeat(3);
        let request = build_request(&endpoint(), &body);
        let text = String::from_utf8(request).unwrap();
        let expected = format!("Content-Length: {}\r\n", body.len());
        assert!(text.contains(&expected));
        assert!(text.ends_with(&body));
    }
}

use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

/// Upper bound on bytes read from a service.
pub const MAX_BANNER_BYTES: usize = 1024;
/// Displayed banners are cut to this many characters.
pub const MAX_BANNER_CHARS: usize = 120;

pub const NO_BANNER: &str = "No banner";
pub const BANNER_TIMEOUT: &str = "Timeout";
pub const BANNER_REFUSED: &str = "Connection refused";

const HTTP_PORTS: &[u16] = &[80, 591, 8000, 8008, 8080, 8081, 8088, 8888];
const MAIL_PORTS: &[u16] = &[25, 587, 2525];

/// Read a service banner from an already-open connection.
///
/// Web and mail ports get a short greeting first; everything else is read
/// passively. Never fails: problems come back as short diagnostic strings.
pub async fn grab_banner(
    stream: &mut TcpStream,
    host: IpAddr,
    port: u16,
    budget: Duration,
) -> String {
    match time::timeout(budget, exchange(stream, host, port)).await {
        Ok(Ok(raw)) if raw.is_empty() => NO_BANNER.to_string(),
        Ok(Ok(raw)) => {
            trace!(target = %host, port, bytes = raw.len(), "banner received");
            let banner = clean_banner(&raw);
            if banner.is_empty() {
                NO_BANNER.to_string()
            } else {
                banner
            }
        }
        Ok(Err(e)) => describe_io_error(&e),
        Err(_) => BANNER_TIMEOUT.to_string(),
    }
}

/// Bytes sent before reading, if the port expects the client to speak first.
pub fn greeting_for_port(host: IpAddr, port: u16) -> Option<Vec<u8>> {
    if HTTP_PORTS.contains(&port) {
        let host = match host {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        let request = format!("GET / HTTP/1.0\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        return Some(request.into_bytes());
    }
    if MAIL_PORTS.contains(&port) {
        return Some(b"EHLO portprobe.local\r\n".to_vec());
    }
    None
}

/// Turn raw service bytes into a single display line.
///
/// HTTP responses are reduced to their `Server:` header when present.
/// Otherwise control characters are dropped, whitespace collapsed and the
/// result truncated.
pub fn clean_banner(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);

    if let Some(server) = http_server_header(&text) {
        return truncate(&normalize(&server));
    }

    truncate(&normalize(&text))
}

fn http_server_header(text: &str) -> Option<String> {
    if !text.starts_with("HTTP/") {
        return None;
    }
    text.lines()
        .take_while(|line| !line.trim().is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("server")
                .then(|| value.trim().to_string())
        })
        .filter(|v| !v.is_empty())
}

fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_BANNER_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_BANNER_CHARS).collect();
    out.push_str("...");
    out
}

async fn exchange(stream: &mut TcpStream, host: IpAddr, port: u16) -> io::Result<Vec<u8>> {
    if let Some(greeting) = greeting_for_port(host, port) {
        stream.write_all(&greeting).await?;
    }
    let mut buf = vec![0u8; MAX_BANNER_BYTES];
    let n = stream.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

fn describe_io_error(e: &io::Error) -> String {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
            BANNER_REFUSED.to_string()
        }
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => BANNER_TIMEOUT.to_string(),
        _ => format!("Banner error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn ssh_banner_is_trimmed() {
        assert_eq!(clean_banner(b"SSH-2.0-OpenSSH_9.6\r\n"), "SSH-2.0-OpenSSH_9.6");
    }

    #[test]
    fn http_server_header_extracted() {
        let raw = b"HTTP/1.1 200 OK\r\nDate: today\r\nserver: nginx/1.25.3\r\n\r\n<html>";
        assert_eq!(clean_banner(raw), "nginx/1.25.3");
    }

    #[test]
    fn http_without_server_header_keeps_text() {
        let raw = b"HTTP/1.0 404 Not Found\r\n\r\n";
        assert_eq!(clean_banner(raw), "HTTP/1.0 404 Not Found");
    }

    #[test]
    fn invalid_utf8_and_controls_are_tolerated() {
        let raw = [b'a', 0xff, 0x00, b'b', b'\t', b'\t', b'c'];
        assert_eq!(clean_banner(&raw), "a\u{fffd} b c");
    }

    #[test]
    fn long_banners_are_truncated() {
        let raw = vec![b'x'; 500];
        let out = clean_banner(&raw);
        assert_eq!(out.chars().count(), MAX_BANNER_CHARS + 3);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn greetings_by_port() {
        let host = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let http = greeting_for_port(host, 80).unwrap();
        assert!(http.starts_with(b"GET / HTTP/1.0\r\nHost: 10.0.0.1"));
        assert!(greeting_for_port(host, 25).unwrap().starts_with(b"EHLO"));
        assert!(greeting_for_port(host, 22).is_none());
    }
}

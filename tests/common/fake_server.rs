//! In-process NNTP server for integration tests.
//!
//! [`FakeNntpServer`] speaks just enough NNTP over TLS on a real socket to
//! drive `NntpSession`: greeting, `AUTHINFO`, `GROUP`, `XOVER`, `HDR Xref`,
//! `XFEATURE COMPRESS GZIP` and `QUIT`, plus scripted connection drops.
//! The certificate under `tests/fixtures/tls` is self-signed, so clients
//! must set `allow_insecure_tls`.

use flate2::Compression;
use flate2::write::ZlibEncoder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use usenet_indexer::ServerConfig;
use usenet_indexer::config::RetryConfig;

/// Epoch used for generated article dates (2020-09-13)
pub const BASE_TS: i64 = 1_600_000_000;

#[derive(Default)]
struct State {
    groups: HashMap<String, (u64, u64)>,
    articles: HashMap<String, BTreeMap<u64, String>>,
    credentials: Option<(String, String)>,
    compression: bool,
    hdr: bool,
    drop_on_xover: usize,
    commands: Vec<String>,
}

/// In-process NNTP server bound to an ephemeral localhost port
pub struct FakeNntpServer {
    port: u16,
    state: Arc<Mutex<State>>,
    connections: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl FakeNntpServer {
    /// Start listening; compression and `HDR` are supported unless disabled
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(State {
            compression: true,
            hdr: true,
            ..Default::default()
        }));
        let connections = Arc::new(AtomicUsize::new(0));
        let acceptor = tls_acceptor();

        let task = {
            let state = state.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let state = state.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Ok(stream) = acceptor.accept(stream).await {
                            let _ = serve(stream, state).await;
                        }
                    });
                }
            })
        };

        Self {
            port,
            state,
            connections,
            task,
        }
    }

    /// Server configuration pointing at this instance
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            tls: true,
            allow_insecure_tls: true,
            username: None,
            password: None,
            connections: 1,
            timeout: Duration::from_secs(5),
        }
    }

    /// Retry settings that keep failing tests fast
    pub fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Require `AUTHINFO USER`/`PASS` before group commands
    pub fn require_auth(&self, user: &str, pass: &str) {
        self.state.lock().unwrap().credentials = Some((user.to_string(), pass.to_string()));
    }

    /// Answer `XFEATURE COMPRESS GZIP` with 500 (`COMPRESS DEFLATE` always is)
    pub fn disable_compression(&self) {
        self.state.lock().unwrap().compression = false;
    }

    /// Answer `HDR` with 500
    pub fn disable_hdr(&self) {
        self.state.lock().unwrap().hdr = false;
    }

    /// Close the connection instead of answering the next `count` XOVERs
    pub fn drop_next_xover(&self, count: usize) {
        self.state.lock().unwrap().drop_on_xover = count;
    }

    /// Advertise a group with the given article range
    pub fn add_group(&self, name: &str, first: u64, last: u64) {
        self.state
            .lock()
            .unwrap()
            .groups
            .insert(name.to_string(), (first, last));
    }

    /// Store `<subject> (<part>/<total>) yEnc` articles for `numbers`, all in one binary
    pub fn add_binary(&self, group: &str, subject: &str, numbers: impl IntoIterator<Item = u64>) {
        let numbers: Vec<u64> = numbers.into_iter().collect();
        let total = numbers.len();
        for (index, number) in numbers.into_iter().enumerate() {
            let line = overview_line(
                number,
                &format!("{subject} ({}/{total}) yEnc", index + 1),
                "poster@example.com",
                BASE_TS + number as i64,
                group,
            );
            self.add_line(group, number, line);
        }
    }

    /// Store a raw overview line
    pub fn add_line(&self, group: &str, number: u64, line: String) {
        self.state
            .lock()
            .unwrap()
            .articles
            .entry(group.to_string())
            .or_default()
            .insert(number, line);
    }

    /// Every command line received, in order (passwords included)
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Commands starting with `verb`
    pub fn commands_named(&self, verb: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.split_whitespace().next() == Some(verb))
            .collect()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakeNntpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Tab-separated overview record with an Xref field
pub fn overview_line(number: u64, subject: &str, from: &str, posted: i64, group: &str) -> String {
    let date = chrono::DateTime::from_timestamp(posted, 0)
        .unwrap()
        .format("%a, %d %b %Y %H:%M:%S +0000");
    format!(
        "{number}\t{subject}\t{from}\t{date}\t<{number}@example.com>\t\t1000\t10\tXref: news.example.com {group}:{number}"
    )
}

fn tls_acceptor() -> TlsAcceptor {
    let cert = CertificateDer::from(include_bytes!("../fixtures/tls/cert.der").to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        include_bytes!("../fixtures/tls/key.der").to_vec(),
    ));
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert], key)
    .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Dot-stuffed multi-line body without the terminating `.` line
fn stuffed_body(lines: &[String]) -> String {
    let mut body = String::new();
    for line in lines {
        if line.starts_with('.') {
            body.push('.');
        }
        body.push_str(line);
        body.push_str("\r\n");
    }
    body
}

/// Value of the `Xref:` field of a stored overview line
fn xref_field(line: &str) -> Option<&str> {
    line.split('\t')
        .skip(8)
        .find_map(|field| field.strip_prefix("Xref: "))
}

async fn serve<S>(stream: S, state: Arc<Mutex<State>>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut selected: Option<String> = None;
    let mut user: Option<String> = None;
    let mut authenticated = state.lock().unwrap().credentials.is_none();
    let mut gzip = false;

    writer.write_all(b"200 fake news server ready\r\n").await?;
    writer.flush().await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        state.lock().unwrap().commands.push(command.clone());

        let mut words = command.split_whitespace();
        let verb = words.next().unwrap_or_default().to_ascii_uppercase();
        let args: Vec<&str> = words.collect();

        let reply: Vec<u8> = match verb.as_str() {
            "AUTHINFO" => {
                let credentials = state.lock().unwrap().credentials.clone();
                match (args.first().map(|a| a.to_ascii_uppercase()), args.get(1)) {
                    (Some(kind), Some(value)) if kind == "USER" => {
                        user = Some(value.to_string());
                        b"381 password required\r\n".to_vec()
                    }
                    (Some(kind), Some(value)) if kind == "PASS" => {
                        let ok = match &credentials {
                            Some((u, p)) => user.as_deref() == Some(u.as_str()) && *value == p.as_str(),
                            None => true,
                        };
                        if ok {
                            authenticated = true;
                            b"281 authentication accepted\r\n".to_vec()
                        } else {
                            b"481 authentication rejected\r\n".to_vec()
                        }
                    }
                    _ => b"501 syntax error\r\n".to_vec(),
                }
            }
            "QUIT" => {
                writer.write_all(b"205 bye\r\n").await?;
                writer.flush().await?;
                return Ok(());
            }
            _ if !authenticated => b"480 authentication required\r\n".to_vec(),
            "GROUP" => {
                let name = args.first().copied().unwrap_or_default();
                let range = state.lock().unwrap().groups.get(name).copied();
                match range {
                    Some((first, last)) => {
                        selected = Some(name.to_string());
                        let count = last.saturating_sub(first) + 1;
                        format!("211 {count} {first} {last} {name}\r\n").into_bytes()
                    }
                    None => b"411 no such group\r\n".to_vec(),
                }
            }
            "XFEATURE" => {
                let supported = state.lock().unwrap().compression;
                if supported {
                    gzip = true;
                    b"290 compression enabled\r\n".to_vec()
                } else {
                    b"500 unknown command\r\n".to_vec()
                }
            }
            "XOVER" => {
                {
                    let mut state = state.lock().unwrap();
                    if state.drop_on_xover > 0 {
                        state.drop_on_xover -= 1;
                        return Ok(());
                    }
                }
                match &selected {
                    None => b"412 no group selected\r\n".to_vec(),
                    Some(group) => {
                        let (first, last) = parse_range(args.first().copied().unwrap_or_default());
                        let lines: Vec<String> = state
                            .lock()
                            .unwrap()
                            .articles
                            .get(group)
                            .map(|a| a.range(first..=last).map(|(_, l)| l.clone()).collect())
                            .unwrap_or_default();

                        if lines.is_empty() {
                            b"420 no articles in range\r\n".to_vec()
                        } else if gzip {
                            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                            encoder.write_all(stuffed_body(&lines).as_bytes())?;
                            let mut reply = b"224 overview follows [COMPRESS=GZIP]\r\n".to_vec();
                            reply.extend_from_slice(&encoder.finish()?);
                            reply.extend_from_slice(b".\r\n");
                            reply
                        } else {
                            format!("224 overview follows\r\n{}.\r\n", stuffed_body(&lines))
                                .into_bytes()
                        }
                    }
                }
            }
            "HDR"
                if state.lock().unwrap().hdr
                    && args.first().is_some_and(|f| f.eq_ignore_ascii_case("xref")) =>
            {
                match &selected {
                    None => b"412 no group selected\r\n".to_vec(),
                    Some(group) => {
                        let (first, last) = parse_range(args.get(1).copied().unwrap_or_default());
                        let lines: Vec<String> = state
                            .lock()
                            .unwrap()
                            .articles
                            .get(group)
                            .map(|a| {
                                a.range(first..=last)
                                    .filter_map(|(n, l)| xref_field(l).map(|x| format!("{n} {x}")))
                                    .collect()
                            })
                            .unwrap_or_default();

                        if lines.is_empty() {
                            b"420 no articles in range\r\n".to_vec()
                        } else {
                            format!("225 headers follow\r\n{}.\r\n", stuffed_body(&lines))
                                .into_bytes()
                        }
                    }
                }
            }
            _ => b"500 unknown command\r\n".to_vec(),
        };
        writer.write_all(&reply).await?;
        writer.flush().await?;
    }
}

fn parse_range(range: &str) -> (u64, u64) {
    match range.split_once('-') {
        Some((first, last)) => (
            first.parse().unwrap_or(0),
            last.parse().unwrap_or(u64::MAX),
        ),
        None => {
            let n = range.parse().unwrap_or(0);
            (n, n)
        }
    }
}

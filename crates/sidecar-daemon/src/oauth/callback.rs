//! One-shot local HTTP listener for the provider's redirect.
//!
//! Runs on its own OS thread: it polls a non-blocking std listener until a
//! `GET /callback` arrives or the deadline passes, answers with a small
//! HTML page and hands the query parameters back through a oneshot.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use reqwest::Url;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::OAuthError;

const CALLBACK_PATH: &str = "/callback";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST_BYTES: usize = 16 * 1024;

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><title>Login complete</title></head>\
<body><h1>Login complete</h1><p>You can close this window and return to the app.</p></body></html>";
const FAILURE_PAGE: &str = "<!DOCTYPE html><html><head><title>Login failed</title></head>\
<body><h1>Login failed</h1><p>The authorization response was incomplete. Please try again.</p></body></html>";

/// Query parameters of the redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    fn from_target(target: &str) -> Option<Self> {
        let url = Url::parse(&format!("http://localhost{target}")).ok()?;
        if url.path() != CALLBACK_PATH {
            return None;
        }
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => params.code = Some(value.into_owned()),
                "state" => params.state = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                _ => {}
            }
        }
        Some(params)
    }

    const fn is_complete(&self) -> bool {
        self.code.is_some() && self.state.is_some()
    }

    /// Check the redirect against the state sent with the authorization
    /// request and return the authorization code.
    pub fn into_code(self, expected_state: &str) -> Result<String, OAuthError> {
        if let Some(error) = self.error {
            return Err(OAuthError::Denied { error });
        }
        let (Some(code), Some(state)) = (self.code, self.state) else {
            return Err(OAuthError::MissingParameters);
        };
        if state != expected_state {
            return Err(OAuthError::StateMismatch);
        }
        Ok(code)
    }
}

/// A bound, not yet serving, callback listener.
#[derive(Debug)]
pub struct CallbackListener {
    listener: TcpListener,
    port: u16,
}

impl CallbackListener {
    /// Bind the first free port in `start..=end` on the loopback interface.
    pub fn bind_in_range(start: u16, end: u16) -> Result<Self, OAuthError> {
        for port in start..=end {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
                Ok(listener) => {
                    let port = listener.local_addr()?.port();
                    debug!(port, "OAuth callback listener bound");
                    return Ok(Self { listener, port });
                }
                Err(e) => debug!(port, error = %e, "Callback port unavailable"),
            }
        }
        Err(OAuthError::NoFreePort { start, end })
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}{CALLBACK_PATH}", self.port)
    }

    /// Serve until one callback arrives or `timeout` elapses.
    pub async fn await_callback(self, timeout: Duration) -> Result<CallbackParams, OAuthError> {
        self.listener.set_nonblocking(true)?;
        let (tx, rx) = oneshot::channel();
        let port = self.port;
        let listener = self.listener;
        std::thread::Builder::new()
            .name("oauth-callback".into())
            .spawn(move || {
                let _ = tx.send(serve_one(&listener, Instant::now() + timeout));
            })?;
        info!(port, timeout_secs = timeout.as_secs(), "Waiting for OAuth callback");
        rx.await.map_err(|_| OAuthError::ListenerStopped)?
    }
}

fn serve_one(listener: &TcpListener, deadline: Instant) -> Result<CallbackParams, OAuthError> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "OAuth callback connection");
                match handle_connection(stream) {
                    Ok(Some(params)) => return Ok(params),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Failed to handle callback connection"),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(OAuthError::Timeout);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Answer one HTTP request. Returns the parameters when it was the callback.
fn handle_connection(mut stream: TcpStream) -> std::io::Result<Option<CallbackParams>> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") && buf.len() < MAX_REQUEST_BYTES {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let request = String::from_utf8_lossy(&buf);
    let target = request
        .lines()
        .next()
        .and_then(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("GET"), Some(target)) => Some(target.to_string()),
                _ => None,
            }
        });

    let Some(params) = target.as_deref().and_then(CallbackParams::from_target) else {
        write_response(&mut stream, "404 Not Found", "Not found")?;
        return Ok(None);
    };

    let page = if params.is_complete() {
        ("200 OK", SUCCESS_PAGE)
    } else {
        ("400 Bad Request", FAILURE_PAGE)
    };
    write_response(&mut stream, page.0, page.1)?;
    Ok(Some(params))
}

fn write_response(stream: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

//! Minimal RTSP client, as spoken by AirTunes receivers.
//!
//! One persistent TCP connection; requests carry a monotonically
//! increasing `CSeq`, a fixed `Client-Instance`, the `Session` echoed
//! from SETUP onwards, and the User-Agent the receiver expects.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::RaopError;

/// Status of an RTSP reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspStatus {
    Ok,
    BadRequest,
    Unauthorized,
    NoResponse,
    InternalError,
    Other(u32),
}

impl RtspStatus {
    pub fn from_code(code: u32) -> RtspStatus {
        match code {
            200 => RtspStatus::Ok,
            400 => RtspStatus::BadRequest,
            401 => RtspStatus::Unauthorized,
            444 => RtspStatus::NoResponse,
            500 => RtspStatus::InternalError,
            other => RtspStatus::Other(other),
        }
    }

    pub fn is_ok(self) -> bool {
        self == RtspStatus::Ok
    }
}

/// A parsed RTSP reply.
#[derive(Debug)]
pub struct RtspResponse {
    pub status: RtspStatus,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RtspResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The RTSP control connection.
pub struct RtspClient {
    stream: BufReader<TcpStream>,
    url: String,
    user_agent: String,
    client_instance: String,
    cseq: u32,
    session: Option<String>,
    /// Headers added to every request until removed (Apple-Challenge).
    sticky_headers: Vec<(String, String)>,
    local_addr: SocketAddr,
}

impl RtspClient {
    /// Connects to the receiver. `sid` is the session-scoped random
    /// identifier used in the `rtsp://<local-ip>/<sid>` URL.
    pub async fn connect(
        host: &str,
        port: u16,
        sid: &str,
        user_agent: &str,
    ) -> Result<RtspClient, RaopError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| RaopError::Unreachable(format!("{host}:{port}: {e}")))?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let client_instance: String = {
            let mut rng = rand::rng();
            (0..16)
                .map(|_| format!("{:X}", rng.random_range(0..16)))
                .collect()
        };
        debug!("rtsp: connected to {host}:{port} from {local_addr}");
        Ok(RtspClient {
            stream: BufReader::new(stream),
            url: format!("rtsp://{}/{}", local_addr.ip(), sid),
            user_agent: user_agent.to_owned(),
            client_instance,
            cseq: 0,
            session: None,
            sticky_headers: Vec::new(),
            local_addr,
        })
    }

    pub fn local_ip(&self) -> std::net::IpAddr {
        self.local_addr.ip()
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Adds a header sent with every subsequent request.
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.sticky_headers
            .push((name.to_owned(), value.to_owned()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.sticky_headers.retain(|(k, _)| k != name);
    }

    /// Sends one request and reads its reply. A non-200 status is an
    /// error carrying the numeric code.
    pub async fn exec(
        &mut self,
        method: &str,
        extra_headers: &[(&str, &str)],
        content: Option<(&str, &[u8])>,
    ) -> Result<RtspResponse, RaopError> {
        self.cseq += 1;
        let mut req = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", method, self.url, self.cseq);
        if let Some(session) = &self.session {
            req.push_str(&format!("Session: {session}\r\n"));
        }
        for (k, v) in extra_headers {
            req.push_str(&format!("{k}: {v}\r\n"));
        }
        for (k, v) in &self.sticky_headers {
            req.push_str(&format!("{k}: {v}\r\n"));
        }
        req.push_str(&format!("Client-Instance: {}\r\n", self.client_instance));
        req.push_str(&format!("User-Agent: {}\r\n", self.user_agent));
        if let Some((content_type, body)) = content {
            req.push_str(&format!(
                "Content-Type: {content_type}\r\nContent-Length: {}\r\n",
                body.len()
            ));
        }
        req.push_str("\r\n");

        trace!("rtsp: > {method} CSeq {}", self.cseq);
        let stream = self.stream.get_mut();
        stream.write_all(req.as_bytes()).await?;
        if let Some((_, body)) = content {
            stream.write_all(body).await?;
        }
        stream.flush().await?;

        let response = self.read_response().await?;
        if let Some(session) = response.header("Session") {
            // Le serveur attribue la session à SETUP ; on la rejoue
            // ensuite sur chaque requête.
            self.session = Some(session.split(';').next().unwrap_or(session).to_owned());
        }
        if !response.status.is_ok() {
            return Err(RaopError::Rtsp(response.status));
        }
        Ok(response)
    }

    async fn read_line(&mut self) -> Result<String, RaopError> {
        let mut line = Vec::new();
        loop {
            let b = self.stream.read_u8().await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    RaopError::Rtsp(RtspStatus::NoResponse)
                } else {
                    RaopError::Io(e)
                }
            })?;
            match b {
                b'\n' => break,
                b'\r' => continue,
                other => line.push(other),
            }
        }
        String::from_utf8(line).map_err(|_| RaopError::BadResponse("non-UTF-8 line".into()))
    }

    async fn read_response(&mut self) -> Result<RtspResponse, RaopError> {
        let status_line = self.read_line().await?;
        let mut parts = status_line.split_whitespace();
        let proto = parts.next().unwrap_or("");
        if !proto.starts_with("RTSP/") {
            return Err(RaopError::BadResponse(format!(
                "bad status line: {status_line}"
            )));
        }
        let code: u32 = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| RaopError::BadResponse(format!("bad status line: {status_line}")))?;

        let mut headers = HashMap::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            if let Some((k, v)) = line.split_once(':') {
                headers.insert(k.trim().to_owned(), v.trim().to_owned());
            }
        }

        let mut body = Vec::new();
        if let Some(length) = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
        {
            body.resize(length, 0);
            self.stream.read_exact(&mut body).await?;
        }

        trace!("rtsp: < {code}");
        Ok(RtspResponse {
            status: RtspStatus::from_code(code),
            headers,
            body,
        })
    }

    // Convenience wrappers for the RAOP dialogue.

    pub async fn options(&mut self) -> Result<RtspResponse, RaopError> {
        self.exec("OPTIONS", &[], None).await
    }

    pub async fn announce(&mut self, sdp: &str) -> Result<RtspResponse, RaopError> {
        self.exec("ANNOUNCE", &[], Some(("application/sdp", sdp.as_bytes())))
            .await
    }

    pub async fn setup(&mut self, transport: &str) -> Result<RtspResponse, RaopError> {
        self.exec("SETUP", &[("Transport", transport)], None).await
    }

    pub async fn record(&mut self, seq: u16, rtptime: u32) -> Result<RtspResponse, RaopError> {
        let rtp_info = format!("seq={seq};rtptime={rtptime}");
        self.exec(
            "RECORD",
            &[("Range", "npt=0-"), ("RTP-Info", rtp_info.as_str())],
            None,
        )
        .await
    }

    pub async fn set_parameter(&mut self, body: &str) -> Result<RtspResponse, RaopError> {
        self.exec("SET_PARAMETER", &[], Some(("text/parameters", body.as_bytes())))
            .await
    }

    pub async fn flush(&mut self, seq: u16, rtptime: u32) -> Result<RtspResponse, RaopError> {
        let rtp_info = format!("seq={seq};rtptime={rtptime}");
        self.exec("FLUSH", &[("RTP-Info", rtp_info.as_str())], None)
            .await
    }

    pub async fn teardown(&mut self) -> Result<RtspResponse, RaopError> {
        self.exec("TEARDOWN", &[], None).await
    }
}

/// Parses the `Transport` reply header into its `key=value` fields.
pub fn parse_transport(value: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for token in value.split(';') {
        match token.split_once('=') {
            Some((k, v)) => {
                out.insert(k.trim().to_owned(), v.trim().to_owned());
            }
            None => {
                out.insert(token.trim().to_owned(), String::new());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    async fn fake_receiver() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = vec![0u8; 4096];
            for reply in [
                "RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n",
                "RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: DEADBEEF\r\n\
                 Transport: RTP/AVP/UDP;unicast;server_port=6000;control_port=6001;timing_port=6002\r\n\r\n",
                "RTSP/1.0 453 Not Enough Bandwidth\r\nCSeq: 3\r\n\r\n",
            ] {
                let n = stream.read(&mut buf).await.unwrap();
                seen.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                stream.write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn dialogue_carries_cseq_session_and_agent() {
        let (addr, handle) = fake_receiver().await;
        let mut rtsp = RtspClient::connect(&addr.ip().to_string(), addr.port(), "12345", "iTunes/7.6.2 (Windows; N;)")
            .await
            .unwrap();

        rtsp.options().await.unwrap();
        let setup = rtsp
            .setup("RTP/AVP/UDP;unicast;interleaved=0-1;mode=record")
            .await
            .unwrap();
        let transport = parse_transport(setup.header("Transport").unwrap());
        assert_eq!(transport.get("server_port").unwrap(), "6000");
        assert_eq!(rtsp.session(), Some("DEADBEEF"));

        // Une erreur RTSP remonte le code numérique.
        match rtsp.options().await {
            Err(RaopError::Rtsp(RtspStatus::Other(453))) => {}
            other => panic!("unexpected {other:?}"),
        }

        let seen = handle.await.unwrap();
        assert!(seen[0].contains("CSeq: 1"));
        assert!(seen[0].contains("User-Agent: iTunes/7.6.2 (Windows; N;)"));
        assert!(seen[0].contains("Client-Instance: "));
        assert!(seen[1].contains("CSeq: 2"));
        // La session du SETUP est rejouée ensuite.
        assert!(seen[2].contains("Session: DEADBEEF"));
    }
}

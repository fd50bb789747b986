//! Just enough of an RTSP server to hand one consumer an SDP and switch the
//! connection over to interleaved `$` framing.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::model::packet::MediaKind;
use crate::model::tracks::TrackBinding;

/// Upper bound for a single request head line, to keep a misbehaving client
/// from growing the buffer forever.
const MAX_LINE: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The track a SETUP request addresses, from the `trackID=` control suffix.
    pub fn track(&self) -> Option<MediaKind> {
        let (_, id) = self.uri.rsplit_once("trackID=")?;
        match id.trim_end_matches('/') {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// Reads one request. Returns `None` if the client closed the connection
/// before sending anything.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<RtspRequest>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();

    // Tolerate blank lines between requests.
    let request_line = loop {
        line.clear();
        if read_line(reader, &mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            break trimmed.to_string();
        }
    };

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(BridgeError::Rtsp(format!("bad request line {request_line:?}")));
    };
    if !version.starts_with("RTSP/") {
        return Err(BridgeError::Rtsp(format!("not an RTSP request: {request_line:?}")));
    }

    let mut headers = vec![];
    loop {
        line.clear();
        if read_line(reader, &mut line).await? == 0 {
            return Err(BridgeError::Rtsp("connection closed inside headers".into()));
        }
        let header = line.trim();
        if header.is_empty() {
            break;
        }
        if let Some((k, v)) = header.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    let mut request = RtspRequest {
        method: method.to_ascii_uppercase(),
        uri: uri.to_string(),
        headers,
        body: vec![],
    };

    if let Some(len) = request.header("Content-Length") {
        let len: usize = len
            .parse()
            .map_err(|_| BridgeError::Rtsp(format!("bad Content-Length {len:?}")))?;
        request.body = vec![0; len];
        reader.read_exact(&mut request.body).await?;
    }

    Ok(Some(request))
}

async fn read_line<R>(reader: &mut R, line: &mut String) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let n = reader.read_line(line).await?;
    if line.len() > MAX_LINE {
        return Err(BridgeError::Rtsp("request line too long".into()));
    }
    Ok(n)
}

/// Formats a response. `CSeq` is echoed and `Content-Length` added for a body.
pub fn response(
    request: &RtspRequest,
    status: u16,
    reason: &str,
    headers: &[(&str, String)],
    body: Option<&str>,
) -> String {
    let mut out = format!("RTSP/1.0 {status} {reason}\r\n");
    if let Some(cseq) = request.header("CSeq") {
        out.push_str(&format!("CSeq: {cseq}\r\n"));
    }
    for (k, v) in headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    match body {
        Some(body) => {
            out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
            out.push_str(body);
        }
        None => out.push_str("\r\n"),
    }
    out
}

/// Serves requests until the client sends PLAY.
///
/// DESCRIBE returns `sdp`. Each SETUP is answered with the interleaved
/// channel pair bound to the addressed track, whatever the client proposed.
pub async fn handshake<R, W>(reader: &mut R, writer: &mut W, sdp: &str, session_id: &str) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(request) = read_request(reader).await? else {
            return Err(BridgeError::Rtsp("client closed during handshake".into()));
        };
        debug!("RTSP {} {}", request.method, request.uri);

        let session = format!("{session_id};timeout=60");
        let reply = match request.method.as_str() {
            "OPTIONS" => response(
                &request,
                200,
                "OK",
                &[("Public", "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN".to_string())],
                None,
            ),
            "DESCRIBE" => {
                let base = format!("{}/", request.uri.trim_end_matches('/'));
                response(
                    &request,
                    200,
                    "OK",
                    &[
                        ("Content-Base", base),
                        ("Content-Type", "application/sdp".to_string()),
                    ],
                    Some(sdp),
                )
            }
            "SETUP" => match request.track() {
                Some(kind) => {
                    let binding = TrackBinding::for_kind(kind);
                    let transport = format!(
                        "RTP/AVP/TCP;unicast;interleaved={}-{}",
                        binding.channel_for(false),
                        binding.channel_for(true)
                    );
                    response(
                        &request,
                        200,
                        "OK",
                        &[("Transport", transport), ("Session", session)],
                        None,
                    )
                }
                None => response(&request, 404, "Not Found", &[], None),
            },
            "PLAY" => {
                let reply = response(&request, 200, "OK", &[("Session", session)], None);
                writer.write_all(reply.as_bytes()).await?;
                writer.flush().await?;
                info!("RTSP client is playing");
                return Ok(());
            }
            "TEARDOWN" => {
                let reply = response(&request, 200, "OK", &[("Session", session)], None);
                writer.write_all(reply.as_bytes()).await?;
                return Err(BridgeError::Rtsp("client tore down during handshake".into()));
            }
            _ => response(&request, 501, "Not Implemented", &[], None),
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.flush().await?;
    }
}

/// Wraps `data` in an interleaved frame: `$`, channel, 16-bit length, payload.
pub fn interleaved_frame(channel: u8, data: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(data.len())
        .map_err(|_| BridgeError::Rtsp(format!("{} byte packet does not fit a frame", data.len())))?;
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.push(b'$');
    frame.push(channel);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(data);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    #[test]
    fn frame_layout() {
        let frame = interleaved_frame(3, &[0xAA, 0xBB]).unwrap();
        assert_eq!(frame, vec![b'$', 3, 0, 2, 0xAA, 0xBB]);
        assert!(interleaved_frame(0, &vec![0; 70_000]).is_err());
    }

    #[tokio::test]
    async fn parses_request_with_body() {
        let raw = b"\r\nANNOUNCE rtsp://h/ RTSP/1.0\r\nCSeq: 7\r\ncontent-length: 3\r\n\r\nabcOPTIONS";
        let mut reader = BufReader::new(&raw[..]);
        let req = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(req.method, "ANNOUNCE");
        assert_eq!(req.header("cseq"), Some("7"));
        assert_eq!(req.body, b"abc");
    }

    #[tokio::test]
    async fn eof_before_request_is_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn setup_track_from_uri() {
        let mut req = RtspRequest {
            method: "SETUP".into(),
            uri: "rtsp://127.0.0.1:5000/trackID=video".into(),
            headers: vec![],
            body: vec![],
        };
        assert_eq!(req.track(), Some(MediaKind::Video));
        req.uri = "rtsp://127.0.0.1:5000/stream".into();
        assert_eq!(req.track(), None);
    }

    #[tokio::test]
    async fn handshake_walks_to_play() {
        let (client, server) = duplex(16 * 1024);
        let (server_read, mut server_write) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);

        let serve = tokio::spawn(async move {
            handshake(&mut server_read, &mut server_write, "v=0\r\n", "abc").await
        });

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut client_read = BufReader::new(client_read);
        let url = "rtsp://127.0.0.1:5000";

        let requests = [
            format!("OPTIONS {url} RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
            format!("DESCRIBE {url} RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n"),
            format!("SETUP {url}/trackID=audio RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"),
            format!("SETUP {url}/trackID=video RTSP/1.0\r\nCSeq: 4\r\nTransport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n\r\n"),
            format!("PLAY {url} RTSP/1.0\r\nCSeq: 5\r\nSession: abc\r\n\r\n"),
        ];

        let mut heads = vec![];
        for req in &requests {
            client_write.write_all(req.as_bytes()).await.unwrap();
            let mut head = String::new();
            loop {
                let mut line = String::new();
                client_read.read_line(&mut line).await.unwrap();
                head.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            if head.contains("Content-Length: 5") {
                let mut body = [0u8; 5];
                client_read.read_exact(&mut body).await.unwrap();
                assert_eq!(&body, b"v=0\r\n");
            }
            heads.push(head);
        }

        serve.await.unwrap().unwrap();
        assert!(heads[0].starts_with("RTSP/1.0 200 OK\r\nCSeq: 1\r\n"));
        assert!(heads[1].contains("Content-Base: rtsp://127.0.0.1:5000/\r\n"));
        assert!(heads[2].contains("interleaved=0-1"));
        assert!(heads[3].contains("interleaved=2-3"));
        assert!(heads[4].contains("Session: abc;timeout=60"));
    }

    #[tokio::test]
    async fn close_during_handshake_is_an_error() {
        let (client, server) = duplex(1024);
        drop(client);
        let (r, mut w) = tokio::io::split(server);
        let mut r = BufReader::new(r);
        assert!(handshake(&mut r, &mut w, "v=0", "s").await.is_err());
    }
}

//! Session description rewriting
//!
//! The description negotiated with the remote peer already names the codecs
//! the consumer needs. Pointing it at the local relay only takes swapping the
//! two media ports and tagging each media section with a control attribute
//! that RTSP clients use to address the track.

use std::collections::HashMap;

use crate::error::SdpError;
use crate::model::packet::MediaKind;

/// Rewrites `sdp` so its audio and video sections point at the given ports.
///
/// Every other line is kept in order. An `a=control:trackID=<kind>` line is
/// inserted right after each media line and the result uses CRLF line endings
/// whatever the input used. Calling this on its own output inserts the control
/// lines a second time.
pub fn rewrite(sdp: &str, audio_port: u16, video_port: u16) -> Result<String, SdpError> {
    let mut lines: Vec<String> = sdp.split('\n').map(|l| l.trim().to_string()).collect();

    let audio = find_media_line(&lines, MediaKind::Audio)?;
    let video = find_media_line(&lines, MediaKind::Video)?;

    lines[audio] = replace_port(&lines[audio], audio_port)?;
    lines[video] = replace_port(&lines[video], video_port)?;

    // Insert at the later index first so the earlier one stays valid.
    let (first, second) = if audio < video {
        ((audio, MediaKind::Audio), (video, MediaKind::Video))
    } else {
        ((video, MediaKind::Video), (audio, MediaKind::Audio))
    };
    lines.insert(second.0 + 1, control_line(second.1));
    lines.insert(first.0 + 1, control_line(first.1));

    Ok(lines.join("\r\n"))
}

pub fn control_line(kind: MediaKind) -> String {
    format!("a=control:trackID={kind}")
}

fn find_media_line(lines: &[String], kind: MediaKind) -> Result<usize, SdpError> {
    let prefix = format!("m={kind} ");
    let mut found = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.starts_with(&prefix))
        .map(|(i, _)| i);

    let index = found.next().ok_or(SdpError::MissingMediaLine(kind))?;
    if found.next().is_some() {
        return Err(SdpError::DuplicateMediaLine(kind));
    }
    Ok(index)
}

/// `m=<media> <port>[/<count>] <proto> <fmt> ...`
fn replace_port(line: &str, port: u16) -> Result<String, SdpError> {
    let malformed = || SdpError::MalformedMediaLine(line.to_string());

    let mut parts = line.splitn(3, ' ');
    let media = parts.next().ok_or_else(malformed)?;
    let old_port = parts.next().ok_or_else(malformed)?;

    let digits = old_port
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(old_port.len());
    if digits == 0 || old_port[..digits].parse::<u16>().is_err() {
        return Err(malformed());
    }
    let port_count = &old_port[digits..];

    Ok(match parts.next() {
        Some(rest) => format!("{media} {port}{port_count} {rest}"),
        None => format!("{media} {port}{port_count}"),
    })
}

/// Payload type to media kind, as declared by the media lines of a description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadKinds(HashMap<u8, MediaKind>);

impl PayloadKinds {
    pub fn kind_of(&self, pt: u8) -> Option<MediaKind> {
        self.0.get(&pt).copied()
    }

    /// Adds the entries of `other`, keeping existing ones on conflict.
    pub fn merge(&mut self, other: PayloadKinds) {
        for (pt, kind) in other.0 {
            self.0.entry(pt).or_insert(kind);
        }
    }
}

/// Collects the payload types listed on every audio and video media line.
pub fn payload_kinds(sdp: &str) -> PayloadKinds {
    let mut map = HashMap::new();

    for line in sdp.lines().map(str::trim) {
        let Some(rest) = line.strip_prefix("m=") else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        let kind = match fields.next() {
            Some("audio") => MediaKind::Audio,
            Some("video") => MediaKind::Video,
            _ => continue,
        };
        // Skip port and proto, the rest are formats.
        for pt in fields.skip(2).filter_map(|f| f.parse::<u8>().ok()) {
            map.entry(pt).or_insert(kind);
        }
    }

    PayloadKinds(map)
}

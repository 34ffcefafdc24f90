//! A minimal length-prefixed get/put protocol (§4.9) — not real SFTP,
//! just enough to move single files in and out of an allowlisted
//! directory over an SSH channel's `sftp` subsystem.
//!
//! Wire format, all integers big-endian:
//! ```text
//! request  := op:u8 pathLen:u32 path:[u8; pathLen] (contentLen:u64 if op == PUT)
//! getReply := status:u8 (contentLen:u64 content:[u8; contentLen] | msgLen:u32 msg:[u8; msgLen])
//! putReply := status:u8 (msgLen:u32 msg:[u8; msgLen])?
//! ```
//! `status == 0` is success.

use crate::allowlist;
use std::path::PathBuf;

const OP_GET: u8 = 1;
const OP_PUT: u8 = 2;

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_FILENAME_LEN: usize = 4096;

struct PendingPut {
    path: PathBuf,
    remaining: u64,
    data: Vec<u8>,
    /// Set when the request was already known to be rejected (over-cap
    /// or not allowlisted) while its body is still being drained so the
    /// channel doesn't desync.
    reject: Option<String>,
}

pub struct SftpSession {
    roots: Vec<PathBuf>,
    max_upload_bytes: u64,
    max_filename_len: usize,
    buffer: Vec<u8>,
    pending_put: Option<PendingPut>,
    closed: bool,
}

impl SftpSession {
    pub fn new(roots: Vec<PathBuf>, max_upload_bytes: u64, max_filename_len: usize) -> Self {
        Self {
            roots,
            max_upload_bytes,
            max_filename_len,
            buffer: Vec::new(),
            pending_put: None,
            closed: false,
        }
    }

    /// Feed newly-arrived channel bytes. Returns bytes to write back on
    /// the channel (possibly empty if a full request hasn't arrived
    /// yet). Once a protocol violation is detected, `closed` is set and
    /// all further input is ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.closed {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            if let Some(pending) = &mut self.pending_put {
                let take = (pending.remaining as usize).min(self.buffer.len());
                if pending.reject.is_some() {
                    self.buffer.drain(..take);
                } else {
                    pending.data.extend(self.buffer.drain(..take));
                }
                pending.remaining -= take as u64;
                if pending.remaining > 0 {
                    break;
                }
                let pending = self.pending_put.take().unwrap();
                match pending.reject {
                    Some(reason) => out.extend(reply_error(&reason)),
                    None => out.extend(self.finish_put(pending)),
                }
                continue;
            }

            match self.try_parse_request() {
                ParseOutcome::NeedMore => break,
                ParseOutcome::Invalid => {
                    self.closed = true;
                    break;
                }
                ParseOutcome::Get(path) => out.extend(self.handle_get(&path)),
                ParseOutcome::PutStarted => {}
            }
        }

        out
    }

    fn try_parse_request(&mut self) -> ParseOutcome {
        if self.buffer.len() < 5 {
            return ParseOutcome::NeedMore;
        }
        let op = self.buffer[0];
        let path_len = u32::from_be_bytes(self.buffer[1..5].try_into().unwrap()) as usize;
        if path_len >= self.max_filename_len {
            return ParseOutcome::Invalid;
        }

        match op {
            OP_GET => {
                let total = 5 + path_len;
                if self.buffer.len() < total {
                    return ParseOutcome::NeedMore;
                }
                let path_bytes = self.buffer[5..total].to_vec();
                self.buffer.drain(..total);
                let Ok(path_str) = String::from_utf8(path_bytes) else {
                    return ParseOutcome::Invalid;
                };
                ParseOutcome::Get(path_str)
            }
            OP_PUT => {
                let total = 5 + path_len + 8;
                if self.buffer.len() < total {
                    return ParseOutcome::NeedMore;
                }
                let path_bytes = self.buffer[5..5 + path_len].to_vec();
                let content_len =
                    u64::from_be_bytes(self.buffer[5 + path_len..total].try_into().unwrap());
                self.buffer.drain(..total);

                let Ok(path_str) = String::from_utf8(path_bytes) else {
                    return ParseOutcome::Invalid;
                };
                if content_len > self.max_upload_bytes {
                    self.pending_put = Some(PendingPut {
                        path: PathBuf::new(),
                        remaining: content_len,
                        data: Vec::new(),
                        reject: Some("upload exceeds maximum size".to_string()),
                    });
                    return ParseOutcome::PutStarted;
                }
                let Some(resolved) = allowlist::resolve_allowed_path(&self.roots, &path_str)
                else {
                    // Consume and discard the upload body so the stream
                    // doesn't desync, then report the rejection.
                    self.pending_put = Some(PendingPut {
                        path: PathBuf::new(),
                        remaining: content_len,
                        data: Vec::new(),
                        reject: Some(requested_not_allowed().to_string()),
                    });
                    return ParseOutcome::PutStarted;
                };
                self.pending_put = Some(PendingPut {
                    path: resolved,
                    remaining: content_len,
                    data: Vec::with_capacity(content_len.min(1 << 20) as usize),
                    reject: None,
                });
                ParseOutcome::PutStarted
            }
            _ => ParseOutcome::Invalid,
        }
    }

    fn handle_get(&self, requested: &str) -> Vec<u8> {
        match allowlist::resolve_allowed_path(&self.roots, requested) {
            None => reply_error(requested_not_allowed()),
            Some(path) => match std::fs::read(&path) {
                Ok(content) => {
                    let mut reply = vec![0u8];
                    reply.extend_from_slice(&(content.len() as u64).to_be_bytes());
                    reply.extend_from_slice(&content);
                    reply
                }
                Err(e) => reply_error(&e.to_string()),
            },
        }
    }

    fn finish_put(&self, pending: PendingPut) -> Vec<u8> {
        if let Some(parent) = pending.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return reply_error(&e.to_string());
            }
        }
        match std::fs::write(&pending.path, &pending.data) {
            Ok(()) => vec![0u8],
            Err(e) => reply_error(&e.to_string()),
        }
    }
}

enum ParseOutcome {
    NeedMore,
    Invalid,
    Get(String),
    PutStarted,
}

fn requested_not_allowed() -> &'static str {
    "path not permitted"
}

fn reply_error(message: &str) -> Vec<u8> {
    let mut reply = vec![1u8];
    let bytes = message.as_bytes();
    reply.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    reply.extend_from_slice(bytes);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_request(path: &str) -> Vec<u8> {
        let mut buf = vec![OP_GET];
        buf.extend_from_slice(&(path.len() as u32).to_be_bytes());
        buf.extend_from_slice(path.as_bytes());
        buf
    }

    fn put_request(path: &str, content: &[u8]) -> Vec<u8> {
        let mut buf = vec![OP_PUT];
        buf.extend_from_slice(&(path.len() as u32).to_be_bytes());
        buf.extend_from_slice(path.as_bytes());
        buf.extend_from_slice(&(content.len() as u64).to_be_bytes());
        buf.extend_from_slice(content);
        buf
    }

    #[test]
    fn put_then_get_round_trips_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];
        let mut session = SftpSession::new(roots.clone(), DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_MAX_FILENAME_LEN);

        let reply = session.feed(&put_request("upload.txt", b"hello world"));
        assert_eq!(reply[0], 0);

        let mut getter = SftpSession::new(roots, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_MAX_FILENAME_LEN);
        let reply = getter.feed(&get_request("upload.txt"));
        assert_eq!(reply[0], 0);
        let content_len = u64::from_be_bytes(reply[1..9].try_into().unwrap()) as usize;
        assert_eq!(&reply[9..9 + content_len], b"hello world");
    }

    #[test]
    fn partial_frames_are_buffered_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];
        let mut session = SftpSession::new(roots, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_MAX_FILENAME_LEN);

        let full = put_request("a.bin", b"0123456789");
        let (first, second) = full.split_at(7);
        assert!(session.feed(first).is_empty());
        let reply = session.feed(second);
        assert_eq!(reply[0], 0);
    }

    #[test]
    fn empty_allowlist_denies_get() {
        let mut session = SftpSession::new(Vec::new(), DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_MAX_FILENAME_LEN);
        let reply = session.feed(&get_request("anything.txt"));
        assert_eq!(reply[0], 1);
    }

    #[test]
    fn upload_exceeding_cap_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];
        let mut session = SftpSession::new(roots, 4, DEFAULT_MAX_FILENAME_LEN);
        let reply = session.feed(&put_request("big.bin", b"way too much data"));
        assert_eq!(reply[0], 1);
    }

    #[test]
    fn put_to_disallowed_path_drains_body_and_replies_error() {
        let mut session = SftpSession::new(Vec::new(), DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_MAX_FILENAME_LEN);
        let reply = session.feed(&put_request("anything.txt", b"some content"));
        assert_eq!(reply[0], 1);
        // The buffer must be fully drained, not left desynced for the
        // next request on the same channel.
        assert!(session.buffer.is_empty());
    }

    #[test]
    fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];
        let mut session = SftpSession::new(roots, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_MAX_FILENAME_LEN);
        let reply = session.feed(&get_request("../../etc/passwd"));
        assert_eq!(reply[0], 1);
    }
}

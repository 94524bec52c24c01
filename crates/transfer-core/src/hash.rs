//! Integrity hashing, kept off the signaling task.
//!
//! Hashing a large file is CPU- and I/O-bound, so it runs on the blocking
//! pool and reports its outcome back onto the signaling task through the
//! transfer signal channel; nothing here mutates negotiator state directly.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::driver::TransferSignal;
use crate::errors::Result;
use crate::file::HashAlgo;

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Compute the integrity hash of a file. Blocking; call from the blocking
/// pool, never from the signaling task.
pub fn compute_file_hash(path: &Path, algo: HashAlgo) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut buf = [0u8; 64 * 1024];

    match algo {
        HashAlgo::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex(&hasher.finalize()))
        }
        HashAlgo::Sha1 => {
            let mut hasher = Sha1::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex(&hasher.finalize()))
        }
    }
}

/// Hash a file on the blocking pool and deliver the outcome as a
/// [`TransferSignal`] for the given transfer session.
pub fn spawn_file_hash(
    sid: String,
    path: PathBuf,
    algo: HashAlgo,
    signals: mpsc::UnboundedSender<TransferSignal>,
) {
    tokio::task::spawn_blocking(move || {
        let signal = match compute_file_hash(&path, algo) {
            Ok(hash) => {
                debug!(%sid, %hash, "file hash ready");
                TransferSignal::HashReady { sid, hash }
            }
            Err(e) => {
                warn!(%sid, error = %e, "file hash failed");
                TransferSignal::HashFailed {
                    sid,
                    error: e.to_string(),
                }
            }
        };
        // The signaling task may already be gone during teardown.
        let _ = signals.send(signal);
    });
}

/// Verify a received file against its declared hash. Blocking.
pub fn verify_file_hash(path: &Path, algo: HashAlgo, declared: &str) -> Result<bool> {
    let actual = compute_file_hash(path, algo)?;
    Ok(actual.eq_ignore_ascii_case(declared))
}

/// Derived destination-address digest used when the peer is a room
/// occupant: SHA-1 over sid + our address + room address.
pub fn room_dst_digest(sid: &str, our_addr: &str, room_addr: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(our_addr.as_bytes());
    hasher.update(room_addr.as_bytes());
    hex(&hasher.finalize())
}

/// Listener auth token: SHA-1 over sid + sender + receiver, matching what
/// both ends can derive independently.
pub fn auth_token(sid: &str, sender: &str, receiver: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(sender.as_bytes());
    hasher.update(receiver.as_bytes());
    hex(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("peerwave-hash-{}", uuid::Uuid::new_v4()));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn sha256_of_known_input() {
        let path = temp_file(b"abc");
        let hash = compute_file_hash(&path, HashAlgo::Sha256).unwrap();
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(verify_file_hash(&path, HashAlgo::Sha256, &hash.to_uppercase()).unwrap());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join("peerwave-no-such-file");
        assert!(compute_file_hash(&path, HashAlgo::Sha1).is_err());
    }

    #[test]
    fn auth_token_is_symmetric_for_both_ends() {
        let a = auth_token("sid1", "alice@x/a", "bob@y/b");
        let b = auth_token("sid1", "alice@x/a", "bob@y/b");
        assert_eq!(a, b);
        assert_ne!(a, auth_token("sid2", "alice@x/a", "bob@y/b"));
    }

    #[tokio::test]
    async fn spawned_hash_reports_on_the_signal_channel() {
        let path = temp_file(b"hello");
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_file_hash("s1".into(), path.clone(), HashAlgo::Sha256, tx);
        match rx.recv().await.unwrap() {
            TransferSignal::HashReady { sid, hash } => {
                assert_eq!(sid, "s1");
                assert_eq!(hash.len(), 64);
            }
            other => panic!("unexpected signal: {other:?}"),
        }
        std::fs::remove_file(path).ok();
    }
}

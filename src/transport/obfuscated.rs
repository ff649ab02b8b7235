//! Stream obfuscation layer
//!
//! Wraps a transport in a keyed stream transformation so the session
//! handshake that follows does not present a recognizable protocol
//! signature. The initiator sends a random seed followed by an encrypted
//! prelude of magic, padding length and random padding; both directions
//! then run independent keystreams derived from the seed, the shared
//! keyword and a per-direction label.
//!
//! This is an obfuscation boundary, not a confidentiality boundary; the
//! encrypted session above it provides the latter.

use crate::helper::make_random_padding;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Length of the cleartext seed that opens the exchange
pub const OBFUSCATE_SEED_LENGTH: usize = 16;

/// Hash iterations for keystream key derivation
pub const OBFUSCATE_KEY_ITERATIONS: usize = 6000;

/// Upper bound for the random prelude padding
pub const OBFUSCATE_MAX_PADDING: usize = 8192;

/// Magic value proving both sides derived the same keystream
pub const OBFUSCATE_MAGIC: u32 = 0x0BF5_CA7E;

const CLIENT_TO_SERVER_LABEL: &[u8] = b"client-to-server";
const SERVER_TO_CLIENT_LABEL: &[u8] = b"server-to-client";

const WRITE_CHUNK: usize = 16 * 1024;

/// Keystream generator: iterated-hash key, counter-mode blocks
struct Keystream {
    key: [u8; 32],
    counter: u64,
    block: [u8; 32],
    used: usize,
}

impl Keystream {
    fn derive(seed: &[u8], keyword: &[u8], label: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(keyword);
        hasher.update(label);
        let mut key: [u8; 32] = hasher.finalize().into();
        for _ in 1..OBFUSCATE_KEY_ITERATIONS {
            key = Sha256::digest(key).into();
        }
        Keystream {
            key,
            counter: 0,
            block: [0u8; 32],
            used: 32,
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.used == self.block.len() {
                let mut hasher = Sha256::new();
                hasher.update(self.key);
                hasher.update(self.counter.to_be_bytes());
                self.block = hasher.finalize().into();
                self.counter += 1;
                self.used = 0;
            }
            *byte ^= self.block[self.used];
            self.used += 1;
        }
    }
}

/// A byte stream obfuscated with per-direction keystreams
pub struct ObfuscatedStream<S> {
    inner: S,
    send: Keystream,
    recv: Keystream,
    write_buf: Vec<u8>,
    write_pos: usize,
    write_claimed: usize,
}

impl<S> ObfuscatedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Initiate the obfuscated exchange as the dialing side
    ///
    /// Sends the seed and the encrypted prelude before returning, so the
    /// caller can immediately run a handshake over the stream.
    pub async fn establish(mut inner: S, keyword: &[u8]) -> io::Result<Self> {
        let mut seed = [0u8; OBFUSCATE_SEED_LENGTH];
        rand::thread_rng().fill(&mut seed[..]);

        let mut send = Keystream::derive(&seed, keyword, CLIENT_TO_SERVER_LABEL);
        let recv = Keystream::derive(&seed, keyword, SERVER_TO_CLIENT_LABEL);

        let padding = make_random_padding(0, OBFUSCATE_MAX_PADDING);
        let mut prelude = Vec::with_capacity(8 + padding.len());
        prelude.extend_from_slice(&OBFUSCATE_MAGIC.to_be_bytes());
        prelude.extend_from_slice(&(padding.len() as u32).to_be_bytes());
        prelude.extend_from_slice(&padding);
        send.apply(&mut prelude);

        inner.write_all(&seed).await?;
        inner.write_all(&prelude).await?;
        inner.flush().await?;

        Ok(ObfuscatedStream {
            inner,
            send,
            recv,
            write_buf: Vec::new(),
            write_pos: 0,
            write_claimed: 0,
        })
    }

    /// Accept the obfuscated exchange as the listening side
    pub async fn accept(mut inner: S, keyword: &[u8]) -> io::Result<Self> {
        let mut seed = [0u8; OBFUSCATE_SEED_LENGTH];
        inner.read_exact(&mut seed).await?;

        let send = Keystream::derive(&seed, keyword, SERVER_TO_CLIENT_LABEL);
        let mut recv = Keystream::derive(&seed, keyword, CLIENT_TO_SERVER_LABEL);

        let mut header = [0u8; 8];
        inner.read_exact(&mut header).await?;
        recv.apply(&mut header);

        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != OBFUSCATE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected obfuscation magic",
            ));
        }
        let padding_len =
            u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if padding_len > OBFUSCATE_MAX_PADDING {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "obfuscation padding too large",
            ));
        }
        let mut padding = vec![0u8; padding_len];
        inner.read_exact(&mut padding).await?;
        recv.apply(&mut padding);

        Ok(ObfuscatedStream {
            inner,
            send,
            recv,
            write_buf: Vec::new(),
            write_pos: 0,
            write_claimed: 0,
        })
    }

    /// Drive any buffered obfuscated bytes into the inner stream
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_buf.len() {
            let pending = &self.write_buf[self.write_pos..];
            match Pin::new(&mut self.inner).poll_write(cx, pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "obfuscated stream write returned zero",
                    )));
                }
                Poll::Ready(Ok(written)) => self.write_pos += written,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for ObfuscatedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled_mut();
                this.recv.apply(&mut filled[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S> AsyncWrite for ObfuscatedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_buf.is_empty() {
            // Claim a bounded chunk; the keystream advances once per byte,
            // so the chunk must be reported fully written before new input
            // is accepted.
            let claim = data.len().min(WRITE_CHUNK);
            this.write_buf.extend_from_slice(&data[..claim]);
            this.send.apply(&mut this.write_buf[..]);
            this.write_pos = 0;
            this.write_claimed = claim;
        }

        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(this.write_claimed)),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_both_directions() {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let keyword = b"shared-obfuscation-key";

        let (client, server) = tokio::join!(
            ObfuscatedStream::establish(client_end, keyword),
            ObfuscatedStream::accept(server_end, keyword),
        );
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        client.write_all(b"up the tunnel").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 13];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"up the tunnel");

        server.write_all(b"down the tunnel").await.unwrap();
        server.flush().await.unwrap();
        let mut buf = [0u8; 15];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"down the tunnel");
    }

    #[tokio::test]
    async fn test_large_transfer_stays_in_sync() {
        let (client_end, server_end) = tokio::io::duplex(8 * 1024);
        let keyword = b"key";

        let (client, server) = tokio::join!(
            ObfuscatedStream::establish(client_end, keyword),
            ObfuscatedStream::accept(server_end, keyword),
        );
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.flush().await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_keyword_rejected() {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);

        let (client, server) = tokio::join!(
            ObfuscatedStream::establish(client_end, b"right-key"),
            ObfuscatedStream::accept(server_end, b"wrong-key"),
        );
        client.unwrap();
        let err = server.err().expect("mismatched keyword must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_bytes_on_wire_differ_from_plaintext() {
        let (client_end, mut observer) = tokio::io::duplex(64 * 1024);

        let mut client = ObfuscatedStream::establish(client_end, b"key").await.unwrap();
        // drain seed + prelude
        let mut discard = vec![0u8; 64 * 1024];
        let preamble = observer.read(&mut discard).await.unwrap();
        assert!(preamble >= OBFUSCATE_SEED_LENGTH + 8);

        let plaintext = b"recognizable protocol banner";
        client.write_all(plaintext).await.unwrap();
        client.flush().await.unwrap();

        let mut wire = vec![0u8; plaintext.len()];
        observer.read_exact(&mut wire).await.unwrap();
        assert_ne!(&wire[..], &plaintext[..]);
    }

    #[test]
    fn test_keystreams_differ_by_direction() {
        let seed = [7u8; OBFUSCATE_SEED_LENGTH];
        let mut up = Keystream::derive(&seed, b"key", CLIENT_TO_SERVER_LABEL);
        let mut down = Keystream::derive(&seed, b"key", SERVER_TO_CLIENT_LABEL);

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        up.apply(&mut a);
        down.apply(&mut b);
        assert_ne!(a, b);
    }
}

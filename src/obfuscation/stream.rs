//! Async stream adapter for the obfuscator.
//!
//! Wraps a client-side connection so that the seed message precedes the first
//! write and every byte thereafter passes through the direction ciphers:
//! writes through client→server, reads through server→client.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::obfuscator::Obfuscator;

pin_project! {
    /// A client connection with the obfuscator layered on.
    ///
    /// Implements [`AsyncRead`] and [`AsyncWrite`], so it can stand in
    /// wherever the raw connection would; the TLS dialer layers the handshake
    /// on top of it for profiles that call for obfuscation.
    pub struct ObfuscatedStream<S> {
        #[pin]
        stream: S,
        obfuscator: Obfuscator,
        // Ciphertext accepted from the caller but not yet written through,
        // primed with the seed message at construction.
        send_buf: BytesMut,
    }
}

impl<S> ObfuscatedStream<S> {
    /// Wrap `stream` with a client obfuscator. The staged seed message is
    /// queued so it is the first thing on the wire.
    pub fn new(stream: S, mut obfuscator: Obfuscator) -> Self {
        let send_buf = BytesMut::from(obfuscator.take_seed_message().unwrap_or_default().as_slice());
        ObfuscatedStream {
            stream,
            obfuscator,
            send_buf,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead> AsyncRead for ObfuscatedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let pre = buf.filled().len();
        ready!(this.stream.poll_read(cx, buf))?;
        this.obfuscator
            .obfuscate_server_to_client(&mut buf.filled_mut()[pre..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for ObfuscatedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        // The seed message (and any earlier remainder) must go first.
        while !this.send_buf.is_empty() {
            let n = ready!(this.stream.as_mut().poll_write(cx, this.send_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.send_buf.advance(n);
        }

        let mut owned = buf.to_vec();
        this.obfuscator.obfuscate_client_to_server(&mut owned);
        this.send_buf.extend_from_slice(&owned);

        // Opportunistic flush; the ciphertext is owned either way, so the
        // caller's bytes count as consumed.
        loop {
            if this.send_buf.is_empty() {
                break;
            }
            match this.stream.as_mut().poll_write(cx, this.send_buf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    this.send_buf.advance(n);
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => break,
            }
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        while !this.send_buf.is_empty() {
            let n = ready!(this.stream.as_mut().poll_write(cx, this.send_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.send_buf.advance(n);
        }
        this.stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        while !this.send_buf.is_empty() {
            let n = ready!(this.stream.as_mut().poll_write(cx, this.send_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.send_buf.advance(n);
        }
        this.stream.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::obfuscator::ObfuscatorConfig;
    use crate::obfuscation::prng::{Seed, SEED_LENGTH};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn client_obfuscator() -> Obfuscator {
        let config = ObfuscatorConfig::new("stream-test", None, None)
            .unwrap()
            .with_padding_seed(Seed::from_bytes(&[5u8; SEED_LENGTH]).unwrap());
        Obfuscator::new_client(&config).unwrap()
    }

    #[tokio::test]
    async fn test_stream_sends_seed_message_then_ciphertext() {
        let (client_end, mut server_end) = tokio::io::duplex(64 * 1024);

        let mut stream = ObfuscatedStream::new(client_end, client_obfuscator());
        stream.write_all(b"hello through the veil").await.unwrap();
        stream.flush().await.unwrap();

        let server_cfg = ObfuscatorConfig::new("stream-test", None, None).unwrap();
        let mut server = Obfuscator::new_server(&mut server_end, &server_cfg)
            .await
            .unwrap();

        let mut buf = vec![0u8; 22];
        server_end.read_exact(&mut buf).await.unwrap();
        server.obfuscate_client_to_server(&mut buf);
        assert_eq!(&buf, b"hello through the veil");
    }

    #[tokio::test]
    async fn test_stream_decrypts_reads() {
        let (client_end, mut server_end) = tokio::io::duplex(64 * 1024);

        let mut stream = ObfuscatedStream::new(client_end, client_obfuscator());
        // Force the seed message out so the server can key itself.
        stream.flush().await.unwrap();

        let server_cfg = ObfuscatorConfig::new("stream-test", None, None).unwrap();
        let mut server = Obfuscator::new_server(&mut server_end, &server_cfg)
            .await
            .unwrap();

        let mut downstream = b"response bytes".to_vec();
        server.obfuscate_server_to_client(&mut downstream);
        server_end.write_all(&downstream).await.unwrap();

        let mut buf = vec![0u8; 14];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response bytes");
    }
}

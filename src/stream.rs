use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

/// The byte-oriented duplex transport a connection runs over. After accept
/// or connect, a TLS session may replace the plain TCP stream; everything
/// above this enum is agnostic to which one it got.
pub enum MeshStream {
    Plain(TcpStream),
    Secure(TlsStream<TcpStream>),
    #[cfg(feature = "feature-native-tls")]
    NativeTls(tokio_native_tls::TlsStream<TcpStream>),
}

impl AsyncRead for MeshStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MeshStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MeshStream::Secure(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "feature-native-tls")]
            MeshStream::NativeTls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MeshStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MeshStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MeshStream::Secure(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "feature-native-tls")]
            MeshStream::NativeTls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MeshStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MeshStream::Secure(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "feature-native-tls")]
            MeshStream::NativeTls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MeshStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MeshStream::Secure(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "feature-native-tls")]
            MeshStream::NativeTls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, UdpSocket};

const MAX_DATAGRAM: usize = 1 << 16;

/// Byte stream over a connected UDP socket so the stream framings can run on
/// datagrams. Each write is sent as one datagram; reads drain the last
/// received datagram before waiting for the next.
#[derive(Debug)]
pub struct UdpStream {
    socket: UdpSocket,
    datagram: Vec<u8>,
    start: usize,
    end: usize,
}

impl UdpStream {
    pub async fn connect(endpoint: &str) -> io::Result<Self> {
        let peer = lookup_host(endpoint).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{endpoint} did not resolve"))
        })?;
        let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(Self {
            socket,
            datagram: vec![0; MAX_DATAGRAM],
            start: 0,
            end: 0,
        })
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.start == this.end {
            let mut incoming = ReadBuf::new(&mut this.datagram);
            ready!(this.socket.poll_recv(cx, &mut incoming))?;
            this.end = incoming.filled().len();
            this.start = 0;
        }
        let n = buf.remaining().min(this.end - this.start);
        buf.put_slice(&this.datagram[this.start..this.start + n]);
        this.start += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn frames_travel_as_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut stream = UdpStream::connect(&addr.to_string()).await.unwrap();

        stream.write_all(&[1, 2, 3, 4]).await.unwrap();
        let mut frame = [0u8; 16];
        let (n, client) = server.recv_from(&mut frame).await.unwrap();
        assert_eq!(&frame[..n], &[1, 2, 3, 4]);

        server.send_to(&[9, 8, 7], client).await.unwrap();
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(head, [9, 8]);
        let mut tail = [0u8; 1];
        stream.read_exact(&mut tail).await.unwrap();
        assert_eq!(tail, [7]);
    }
}

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes between the established tunnel and the local process until the
/// tunnel stops delivering.
///
/// `input` is forwarded into the tunnel by a spawned task; when it reaches EOF
/// the tunnel's write side is shut down. The tunnel is copied into `output` on
/// the calling task and the relay returns once that direction ends, whether by
/// EOF or by error.
pub(crate) async fn relay<T, I, O>(tunnel: T, mut input: I, mut output: O)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin,
{
    let (mut from_tunnel, mut to_tunnel) = tokio::io::split(tunnel);

    let upstream = tokio::spawn(async move {
        match tokio::io::copy(&mut input, &mut to_tunnel).await {
            Ok(bytes) => debug!(bytes, "input closed"),
            Err(err) => debug!(error = %err, "forwarding input into tunnel stopped"),
        }
        if let Err(err) = to_tunnel.shutdown().await {
            debug!(error = %err, "failed to shut down tunnel write side");
        }
    });

    match tokio::io::copy(&mut from_tunnel, &mut output).await {
        Ok(bytes) => debug!(bytes, "tunnel closed"),
        Err(err) => debug!(error = %err, "forwarding tunnel into output stopped"),
    }
    if let Err(err) = output.flush().await {
        debug!(error = %err, "failed to flush output");
    }

    upstream.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, duplex};

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[tokio::test]
    async fn relays_both_directions_verbatim() {
        let (tunnel, far_end) = duplex(8 * 1024);
        let sent = pattern(100_000, 7);
        let received = pattern(250_000, 3);
        let mut output = Vec::new();

        let far_end_received = received.clone();
        let ((), from_input) = tokio::join!(
            relay(tunnel, Cursor::new(sent.clone()), &mut output),
            async move {
                let (mut far_read, mut far_write) = tokio::io::split(far_end);
                let mut from_input = Vec::new();
                far_read.read_to_end(&mut from_input).await.unwrap();
                far_write.write_all(&far_end_received).await.unwrap();
                far_write.shutdown().await.unwrap();
                from_input
            },
        );

        assert_eq!(from_input, sent);
        assert_eq!(output, received);
    }

    #[tokio::test]
    async fn tunnel_close_ends_relay_while_input_stays_open() {
        let (tunnel, mut far_end) = duplex(1024);
        // never yields EOF
        let (idle_input, _keep_open) = duplex(16);
        let mut output = Vec::new();

        far_end.write_all(b"bye").await.unwrap();
        drop(far_end);

        relay(tunnel, idle_input, &mut output).await;
        assert_eq!(output, b"bye");
    }

    #[tokio::test]
    async fn empty_input_still_receives_from_tunnel() {
        let (tunnel, far_end) = duplex(1024);
        let mut output = Vec::new();

        let ((), ()) = tokio::join!(
            relay(tunnel, tokio::io::empty(), &mut output),
            async move {
                let (mut far_read, mut far_write) = tokio::io::split(far_end);
                let mut nothing = Vec::new();
                far_read.read_to_end(&mut nothing).await.unwrap();
                assert!(nothing.is_empty());
                far_write.write_all(b"banner").await.unwrap();
            },
        );

        assert_eq!(output, b"banner");
    }
}

/// Ad-hoc text messaging over datagrams.
///
/// One line per datagram, no handshake, no acknowledgment. An exact `"EXIT"`
/// payload ends the receiving loop.

use std::net::SocketAddr;

use crate::error::TransferError;
use crate::progress::CancelToken;
use crate::protocol::{CONTROL_BUF, POLL_INTERVAL, Phrase};
use crate::transport::DatagramTransport;

/// One received chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: SocketAddr,
    pub text: String,
}

/// Send each line to `dest`. Stops after sending `"EXIT"`. Returns the number
/// of messages sent.
pub fn send_messages<I>(dest: SocketAddr, lines: I) -> Result<usize, TransferError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let transport = DatagramTransport::for_peer(dest)?;
    let mut sent = 0;
    for line in lines {
        let text = line.as_ref();
        transport
            .send_to(text.as_bytes(), dest)
            .map_err(TransferError::Transport)?;
        sent += 1;
        if text == Phrase::Exit.as_str() {
            break;
        }
    }
    Ok(sent)
}

/// Receive messages on `bind_addr` until `"EXIT"` arrives or `cancel` is
/// raised. Returns the number of messages handed to `on_message`.
pub fn receive_messages(
    bind_addr: SocketAddr,
    cancel: &CancelToken,
    on_message: impl FnMut(ChatMessage),
) -> Result<usize, TransferError> {
    let transport = DatagramTransport::bind(bind_addr)?;
    receive_on(&transport, cancel, on_message)
}

fn receive_on(
    transport: &DatagramTransport,
    cancel: &CancelToken,
    mut on_message: impl FnMut(ChatMessage),
) -> Result<usize, TransferError> {
    let mut buf = [0u8; CONTROL_BUF];
    let mut received = 0;
    loop {
        let (n, from) = match transport.recv_from_cancellable(&mut buf, POLL_INTERVAL, cancel) {
            Ok(r) => r,
            Err(TransferError::Cancelled) => return Ok(received),
            Err(e) => return Err(e),
        };
        if Phrase::Exit.matches(&buf[..n]) {
            return Ok(received);
        }
        on_message(ChatMessage {
            from,
            text: String::from_utf8_lossy(&buf[..n]).into_owned(),
        });
        received += 1;
    }
}

//! The OpenFlow session layer: framed message I/O over a TCP stream, the
//! outgoing byte queue, xid allocation and the echo keepalive.
//!
//! A session is three tasks around an `OfpConnection` handle: a reader that
//! frames and parses incoming messages, a writer that drains the send queue
//! one write at a time, and an echo timer. All of them talk to the event
//! loop through the hypervisor's channel; the handle itself is only touched
//! from there.

use std::time::Duration;

use bytes::BytesMut;
use log::{debug, trace};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::hypervisor::Event;
use crate::message::Message;
use crate::ofp_header::{OfpHeader, Xid, OFP_HEADER_LENGTH};
use crate::ofp_message::{OfpMessage, OfpSerializationError};
use crate::physical_switch::SwitchId;

/// How often an echo request is sent; a session that has not answered the
/// previous one by the next tick is torn down.
pub const ECHO_INTERVAL: Duration = Duration::from_secs(15);

/// Who a session belongs to; determines which events its tasks emit.
#[derive(Debug, Clone, Copy)]
pub enum SessionPeer {
    /// A physical switch, by internal id.
    Physical(SwitchId),
    /// A tenant controller, by virtual-switch datapath id.
    Tenant(u64),
}

impl SessionPeer {
    fn message_event(self, xid: Xid, message: Message) -> Event {
        match self {
            SessionPeer::Physical(id) => Event::SwitchMessage(id, xid, message),
            SessionPeer::Tenant(dpid) => Event::TenantMessage(dpid, xid, message),
        }
    }

    fn closed_event(self) -> Event {
        match self {
            SessionPeer::Physical(id) => Event::SwitchClosed(id),
            SessionPeer::Tenant(dpid) => Event::TenantClosed(dpid),
        }
    }

    fn echo_event(self) -> Event {
        match self {
            SessionPeer::Physical(id) => Event::SwitchEchoTick(id),
            SessionPeer::Tenant(dpid) => Event::TenantEchoTick(dpid),
        }
    }
}

/// One OpenFlow control-channel session.
pub struct OfpConnection {
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    next_xid: Xid,
    echo_received: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl OfpConnection {
    /// A connection around a raw outgoing byte queue, with no I/O tasks.
    /// Used directly by tests; `open` is the real entry point.
    pub fn new(out_tx: mpsc::UnboundedSender<Vec<u8>>) -> OfpConnection {
        OfpConnection {
            out_tx,
            next_xid: 1,
            // The first echo tick sends a request rather than timing out.
            echo_received: true,
            tasks: vec![],
        }
    }

    /// Start a session on an established stream: spawns the reader, writer
    /// and echo tasks.
    pub fn open(
        stream: TcpStream,
        peer: SessionPeer,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> OfpConnection {
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let mut connection = OfpConnection::new(out_tx);
        connection
            .tasks
            .push(tokio::spawn(write_loop(write_half, out_rx, peer, event_tx.clone())));
        connection
            .tasks
            .push(tokio::spawn(read_loop(read_half, peer, event_tx.clone())));
        connection.tasks.push(tokio::spawn(echo_loop(peer, event_tx)));
        connection
    }

    /// Allocate the next transaction id. Wrapping is allowed.
    pub fn allocate_xid(&mut self) -> Xid {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);
        xid
    }

    /// Serialize and enqueue a message under a fresh xid; returns the xid
    /// used.
    pub fn send_message(&mut self, message: Message) -> Result<Xid, OfpSerializationError> {
        let xid = self.allocate_xid();
        self.send_message_with_xid(xid, message)?;
        Ok(xid)
    }

    /// Serialize and enqueue a message under the given xid.
    pub fn send_message_with_xid(
        &mut self,
        xid: Xid,
        message: Message,
    ) -> Result<(), OfpSerializationError> {
        let bytes = Message::marshal(xid, message)?;
        if self.out_tx.send(bytes).is_err() {
            trace!("dropping message for a closed connection");
        }
        Ok(())
    }

    pub fn echo_received(&self) -> bool {
        self.echo_received
    }

    pub fn set_echo_received(&mut self, received: bool) {
        self.echo_received = received;
    }

    /// Cancel the session tasks and drop the send queue.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for OfpConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle the messages owned by the session layer itself. Returns true when
/// the message was consumed here. Experimenter traffic is out of scope and
/// dies here as well.
pub fn handle_symmetric(
    connection: &mut OfpConnection,
    xid: Xid,
    message: &Message,
) -> Result<bool, OfpSerializationError> {
    match message {
        Message::Hello => {
            trace!("hello received");
            Ok(true)
        }
        Message::EchoRequest(bytes) => {
            connection.send_message_with_xid(xid, Message::EchoReply(bytes.clone()))?;
            Ok(true)
        }
        Message::EchoReply(_) => {
            connection.set_echo_received(true);
            Ok(true)
        }
        Message::Unsupported {
            code: crate::openflow::MsgCode::Experimenter,
        } => {
            debug!("experimenter message ignored");
            Ok(true)
        }
        _ => Ok(false),
    }
}

async fn write_loop(
    mut socket: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    peer: SessionPeer,
    event_tx: mpsc::UnboundedSender<Event>,
) {
    while let Some(bytes) = out_rx.recv().await {
        if let Err(error) = socket.write_all(&bytes).await {
            debug!("session write failed: {}", error);
            let _ = event_tx.send(peer.closed_event());
            return;
        }
    }
}

async fn read_loop(
    mut socket: OwnedReadHalf,
    peer: SessionPeer,
    event_tx: mpsc::UnboundedSender<Event>,
) {
    let mut rd = BytesMut::with_capacity(4096);
    loop {
        match read_message(&mut socket, &mut rd).await {
            Ok(Some((header, message))) => {
                if event_tx
                    .send(peer.message_event(header.xid(), message))
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => break,
            Err(error) => {
                debug!("session read failed: {}", error);
                break;
            }
        }
    }
    let _ = event_tx.send(peer.closed_event());
}

/// Read one framed message: header first, then the length-prefixed body.
/// `Ok(None)` is a clean EOF on a message boundary.
async fn read_message(
    socket: &mut OwnedReadHalf,
    rd: &mut BytesMut,
) -> Result<Option<(OfpHeader, Message)>, OfpSerializationError> {
    while rd.len() < OFP_HEADER_LENGTH {
        if socket.read_buf(rd).await? == 0 {
            if rd.is_empty() {
                return Ok(None);
            }
            return Err(short_read_error(rd.len()));
        }
    }

    let length = ((rd[2] as usize) << 8) + rd[3] as usize;
    if length < OFP_HEADER_LENGTH {
        return Err(OfpSerializationError::UnexpectedValueError {
            value: format!("{}", length),
            field: "length".to_string(),
            message: "message header".to_string(),
        });
    }
    while rd.len() < length {
        if socket.read_buf(rd).await? == 0 {
            return Err(short_read_error(rd.len()));
        }
    }

    let header_data = rd.split_to(OFP_HEADER_LENGTH);
    let body = rd.split_to(length - OFP_HEADER_LENGTH);
    let header = OfpHeader::parse(&header_data)?;
    let (_xid, message) = Message::parse(&header, &body)?;
    Ok(Some((header, message)))
}

fn short_read_error(len: usize) -> OfpSerializationError {
    OfpSerializationError::UnexpectedValueError {
        value: format!("{} bytes", len),
        field: "partial message".to_string(),
        message: "closed connection".to_string(),
    }
}

async fn echo_loop(peer: SessionPeer, event_tx: mpsc::UnboundedSender<Event>) {
    let mut interval = tokio::time::interval(ECHO_INTERVAL);
    // The immediate first tick is skipped so the first check happens a full
    // interval after startup.
    interval.tick().await;
    loop {
        interval.tick().await;
        if event_tx.send(peer.echo_event()).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ofp_header::OPENFLOW_0_04_VERSION;

    fn connection() -> (OfpConnection, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OfpConnection::new(tx), rx)
    }

    #[test]
    fn test_xids_are_allocated_in_sequence() {
        let (mut connection, mut out_rx) = connection();
        let first = connection.send_message(Message::FeaturesReq).unwrap();
        let second = connection.send_message(Message::BarrierRequest).unwrap();
        assert_eq!(second, first.wrapping_add(1));

        let bytes = out_rx.try_recv().unwrap();
        let header = OfpHeader::parse(&bytes[..OFP_HEADER_LENGTH]).unwrap();
        assert_eq!(header.xid(), first);
        assert_eq!(header.version(), OPENFLOW_0_04_VERSION);
    }

    #[test]
    fn test_echo_request_is_answered_in_place() {
        let (mut connection, mut out_rx) = connection();
        let consumed =
            handle_symmetric(&mut connection, 9, &Message::EchoRequest(vec![1, 2, 3])).unwrap();
        assert!(consumed);

        let bytes = out_rx.try_recv().unwrap();
        let header = OfpHeader::parse(&bytes[..OFP_HEADER_LENGTH]).unwrap();
        let (xid, message) = Message::parse(&header, &bytes[OFP_HEADER_LENGTH..]).unwrap();
        assert_eq!(xid, 9);
        assert_eq!(message, Message::EchoReply(vec![1, 2, 3]));
    }

    #[test]
    fn test_echo_reply_marks_the_session_alive() {
        let (mut connection, _out_rx) = connection();
        connection.set_echo_received(false);
        handle_symmetric(&mut connection, 1, &Message::EchoReply(vec![])).unwrap();
        assert!(connection.echo_received());
    }

    #[test]
    fn test_asymmetric_messages_are_not_consumed() {
        let (mut connection, _out_rx) = connection();
        let consumed = handle_symmetric(&mut connection, 1, &Message::FeaturesReq).unwrap();
        assert!(!consumed);
    }
}

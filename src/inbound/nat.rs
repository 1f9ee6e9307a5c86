//! Per-source UDP sessions for inbounds that forward datagrams to a router
//!
//! Every client source address gets one `NatSession`, a packet connection
//! whose reads yield that client's datagrams and whose writes go back to the
//! client through the inbound socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::common::{Address, PacketConn, SharedPacketConn};
use crate::error::{Error, Result};

/// Datagrams buffered per session before new ones are dropped
const SESSION_QUEUE_SIZE: usize = 64;

pub struct NatSession {
    source: SocketAddr,
    destination: Address,
    inbound: SharedPacketConn,
    sender: mpsc::Sender<Bytes>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: watch::Sender<bool>,
}

impl NatSession {
    fn new(source: SocketAddr, destination: Address, inbound: SharedPacketConn) -> Self {
        let (sender, receiver) = mpsc::channel(SESSION_QUEUE_SIZE);
        Self {
            source,
            destination,
            inbound,
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            closed: watch::channel(false).0,
        }
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    /// Queue a datagram from the client; false when it had to be dropped
    pub fn push(&self, payload: Bytes) -> bool {
        !*self.closed.borrow() && self.sender.try_send(payload).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl PacketConn for NatSession {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut closed = self.closed.subscribe();
        let mut receiver = self.receiver.lock().await;
        let payload = tokio::select! {
            payload = receiver.recv() => payload.ok_or(Error::Closed)?,
            _ = closed.wait_for(|closed| *closed) => return Err(Error::Closed),
        };
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, self.destination.clone()))
    }

    /// Replies always go to the session's client, whatever `_from` says
    async fn write_packet(&self, payload: Bytes, _from: Address) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inbound
            .write_packet(payload, Address::Socket(self.source))
            .await
    }

    /// Ends this session only; the inbound socket stays open
    fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inbound.local_addr()
    }
}

/// Live sessions keyed by client source address
#[derive(Default)]
pub struct NatTable {
    sessions: Mutex<HashMap<SocketAddr, Arc<NatSession>>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session for `source`, and whether it was created by this call
    pub fn get_or_create(
        &self,
        source: SocketAddr,
        destination: &Address,
        inbound: &SharedPacketConn,
    ) -> (Arc<NatSession>, bool) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&source) {
            if !session.is_closed() {
                return (session.clone(), false);
            }
        }
        let session = Arc::new(NatSession::new(source, destination.clone(), inbound.clone()));
        sessions.insert(source, session.clone());
        (session, true)
    }

    /// Drop `session` from the table unless it was already replaced
    pub fn remove(&self, session: &Arc<NatSession>) {
        let mut sessions = self.sessions.lock();
        if let Some(current) = sessions.get(&session.source) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(&session.source);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Close every session
    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            let _ = session.close();
        }
    }
}

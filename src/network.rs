//! In-process party directory and duplex sessions over tokio channels
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::party::{Party, PublicKey};
use crate::protocol::ProtocolMessage;

const SESSION_BUFFER: usize = 8;
const INBOX_BUFFER: usize = 64;

/// One end of a two-party conversation about a single transition.
#[derive(Debug)]
pub struct Session {
    counterparty: Party,
    outbound: mpsc::Sender<ProtocolMessage>,
    inbound: mpsc::Receiver<ProtocolMessage>,
}

impl Session {
    pub fn counterparty(&self) -> &Party {
        &self.counterparty
    }

    pub async fn send(&self, message: ProtocolMessage) -> Result<(), SessionError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SessionError::Closed(self.counterparty.to_string()))
    }

    pub async fn receive(&mut self) -> Result<ProtocolMessage, SessionError> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| SessionError::Closed(self.counterparty.to_string()))
    }
}

/// A session opened by another party, delivered to the responder's inbox.
#[derive(Debug)]
pub struct IncomingSession {
    pub session: Session,
}

impl IncomingSession {
    pub fn initiator(&self) -> &Party {
        self.session.counterparty()
    }
}

/// Directory of reachable parties. Cloning shares the directory.
#[derive(Clone, Default)]
pub struct Network {
    directory: Arc<RwLock<HashMap<PublicKey, mpsc::Sender<IncomingSession>>>>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `party` reachable and returns the inbox its responder drains.
    pub fn register(&self, party: Party) -> mpsc::Receiver<IncomingSession> {
        let (inbox, receiver) = mpsc::channel(INBOX_BUFFER);
        if let Ok(mut directory) = self.directory.write() {
            directory.insert(party.key, inbox);
        }
        receiver
    }

    /// Removes `key` from the directory. Sessions already open stay open.
    pub fn disconnect(&self, key: &PublicKey) {
        if let Ok(mut directory) = self.directory.write() {
            directory.remove(key);
        }
    }

    /// Opens a session from `from` to `to`, handing the far end to `to`'s responder.
    pub async fn open_session(&self, from: &Party, to: &Party) -> Result<Session, SessionError> {
        let inbox = {
            let directory = self
                .directory
                .read()
                .map_err(|_| SessionError::Unreachable(to.to_string()))?;
            directory
                .get(&to.key)
                .cloned()
                .ok_or_else(|| SessionError::Unreachable(to.to_string()))?
        };

        let (to_responder, responder_inbound) = mpsc::channel(SESSION_BUFFER);
        let (to_initiator, initiator_inbound) = mpsc::channel(SESSION_BUFFER);

        let far_end = IncomingSession {
            session: Session {
                counterparty: from.clone(),
                outbound: to_initiator,
                inbound: responder_inbound,
            },
        };
        inbox
            .send(far_end)
            .await
            .map_err(|_| SessionError::Unreachable(to.to_string()))?;

        Ok(Session {
            counterparty: to.clone(),
            outbound: to_responder,
            inbound: initiator_inbound,
        })
    }
}

//! File de messages asynchrone entre threads.
//!
//! Chaque message porte une cible (objet implémentant [`MsgObject`]),
//! un code, une charge utile opaque, un offset et une vue mémoire
//! optionnelle. [`AsyncMsgQ::post`] dépose sans bloquer ;
//! [`AsyncMsgQ::send`] dépose puis attend la valeur de retour du
//! `process_msg` de la cible, ce qui en fait une barrière de
//! synchronisation : l'appelant observe tous ses posts précédents.
//!
//! L'ordre est FIFO par émetteur ; entre émetteurs distincts, aucun
//! ordre n'est garanti. Détruire la file abandonne les messages en
//! attente et fait échouer les `send` en cours.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use sabcore::MemChunk;

use crate::error::LoopError;

/// Code réservé : demande d'arrêt du thread consommateur.
pub const MSG_SHUTDOWN: u32 = u32::MAX;

/// Charge utile opaque d'un message.
pub type MsgPayload = Option<Box<dyn Any + Send>>;

/// Cible d'un message.
///
/// `process_msg` s'exécute sur le thread consommateur de la file (le
/// thread IO pour un sink). La cible doit tolérer des messages reçus
/// après son unlink tant que des références circulent encore.
#[async_trait::async_trait]
pub trait MsgObject: Send + Sync {
    async fn process_msg(
        &self,
        code: u32,
        payload: &mut MsgPayload,
        offset: i64,
        chunk: Option<&MemChunk>,
    ) -> Result<i64, LoopError>;
}

/// Un message en transit.
pub struct Message {
    pub target: Option<Arc<dyn MsgObject>>,
    pub code: u32,
    pub payload: MsgPayload,
    pub offset: i64,
    pub chunk: Option<MemChunk>,
    reply: Option<oneshot::Sender<Result<i64, LoopError>>>,
}

impl Message {
    /// Message de contrôle sans cible (`MSG_SHUTDOWN` notamment).
    pub fn control(code: u32) -> Self {
        Message {
            target: None,
            code,
            payload: None,
            offset: 0,
            chunk: None,
            reply: None,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.target.is_none() && self.code == MSG_SHUTDOWN
    }

    /// Exécute `process_msg` sur la cible et achemine la réponse vers
    /// l'éventuel `send` en attente.
    pub async fn dispatch(mut self) {
        let result = match &self.target {
            Some(target) => {
                target
                    .process_msg(self.code, &mut self.payload, self.offset, self.chunk.as_ref())
                    .await
            }
            None => Ok(0),
        };
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        // Message abandonné sans dispatch : le send correspondant doit
        // échouer plutôt qu'attendre indéfiniment.
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(LoopError::NoReply));
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("code", &self.code)
            .field("offset", &self.offset)
            .field("has_chunk", &self.chunk.is_some())
            .field("wants_reply", &self.reply.is_some())
            .finish()
    }
}

/// Côté émetteur de la file. Clonable.
#[derive(Clone)]
pub struct AsyncMsgQ {
    tx: mpsc::UnboundedSender<Message>,
}

impl AsyncMsgQ {
    pub fn new() -> (AsyncMsgQ, AsyncMsgQReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AsyncMsgQ { tx }, AsyncMsgQReceiver { rx })
    }

    /// Dépose sans attendre de réponse.
    pub fn post(
        &self,
        target: Option<Arc<dyn MsgObject>>,
        code: u32,
        payload: MsgPayload,
        offset: i64,
        chunk: Option<MemChunk>,
    ) -> Result<(), LoopError> {
        self.tx
            .send(Message {
                target,
                code,
                payload,
                offset,
                chunk,
                reply: None,
            })
            .map_err(|_| LoopError::QueueClosed)
    }

    /// Dépose puis attend que le message ait été traité (et, si une
    /// cible est fournie, la valeur de retour de son `process_msg`).
    pub async fn send(
        &self,
        target: Option<Arc<dyn MsgObject>>,
        code: u32,
        payload: MsgPayload,
        offset: i64,
        chunk: Option<MemChunk>,
    ) -> Result<i64, LoopError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Message {
                target,
                code,
                payload,
                offset,
                chunk,
                reply: Some(reply_tx),
            })
            .map_err(|_| LoopError::QueueClosed)?;
        reply_rx.await.map_err(|_| LoopError::NoReply)?
    }

    /// Dépose un message de contrôle.
    pub fn post_control(&self, code: u32) -> Result<(), LoopError> {
        self.tx
            .send(Message::control(code))
            .map_err(|_| LoopError::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Côté consommateur, détenu par le thread IO (via son rtpoll).
pub struct AsyncMsgQReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl AsyncMsgQReceiver {
    /// Prochain message ; `None` quand tous les émetteurs ont disparu.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Message déjà disponible, sans attendre.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Adder {
        seen: AtomicI64,
    }

    #[async_trait::async_trait]
    impl MsgObject for Adder {
        async fn process_msg(
            &self,
            code: u32,
            _payload: &mut MsgPayload,
            offset: i64,
            _chunk: Option<&MemChunk>,
        ) -> Result<i64, LoopError> {
            self.seen.fetch_add(offset, Ordering::SeqCst);
            Ok(code as i64 + offset)
        }
    }

    #[tokio::test]
    async fn send_waits_for_reply() {
        let (q, mut rx) = AsyncMsgQ::new();
        let target = Arc::new(Adder {
            seen: AtomicI64::new(0),
        });
        let t2 = target.clone();
        let consumer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let shutdown = msg.is_shutdown();
                msg.dispatch().await;
                if shutdown {
                    break;
                }
            }
        });

        // Les posts précédant un send sont observés avant sa réponse.
        q.post(Some(target.clone()), 1, None, 10, None).unwrap();
        q.post(Some(target.clone()), 2, None, 20, None).unwrap();
        let r = q.send(Some(target.clone()), 3, None, 30, None).await.unwrap();
        assert_eq!(r, 33);
        assert_eq!(t2.seen.load(Ordering::SeqCst), 60);

        q.post_control(MSG_SHUTDOWN).unwrap();
        drop(q);
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_queue_fails_pending_send() {
        let (q, rx) = AsyncMsgQ::new();
        let target = Arc::new(Adder {
            seen: AtomicI64::new(0),
        });
        let send = tokio::spawn({
            let q = q.clone();
            async move { q.send(Some(target), 1, None, 0, None).await }
        });
        tokio::task::yield_now().await;
        drop(rx);
        let err = send.await.unwrap();
        assert!(err.is_err());
    }
}

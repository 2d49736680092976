//! Command dispatch and reply routing.
//!
//! A `PDispatch` sits between a packet stream and the code that speaks
//! the protocol. Inbound packets are parsed as `(command, tag, ...)`;
//! `REPLY` and `ERROR` are matched against outstanding requests, every
//! other command goes through the handler table. Each outstanding
//! request carries a deadline; expiry delivers a synthetic
//! [`ReplyEvent::Timeout`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use crate::command::Command;
use crate::errcode::ErrCode;
use crate::error::WireError;
use crate::packet::Packet;
use crate::tagstruct::TagStruct;

/// Outcome of an outstanding request.
#[derive(Debug)]
pub enum ReplyEvent {
    /// `REPLY` arrived; the tag-struct cursor sits after the tag field.
    Reply(TagStruct),
    /// `ERROR` arrived with this code.
    Error(ErrCode),
    /// The reply timer expired before anything arrived.
    Timeout,
    /// The stream died while the request was pending.
    Died,
}

type Handler = Box<dyn FnMut(Command, u32, TagStruct) + Send>;
type Fallback = Box<dyn FnMut(u32, u32, TagStruct) + Send>;

struct Inner {
    handlers: Mutex<HashMap<u32, Handler>>,
    fallback: Mutex<Option<Fallback>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<ReplyEvent>>>,
    drain_waiters: Mutex<Vec<oneshot::Sender<()>>>,
}

/// The dispatcher. Clonable; all clones share the same tables.
#[derive(Clone)]
pub struct PDispatch {
    inner: Arc<Inner>,
}

impl PDispatch {
    pub fn new() -> Self {
        PDispatch {
            inner: Arc::new(Inner {
                handlers: Mutex::new(HashMap::new()),
                fallback: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                drain_waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Installs the handler for one command.
    pub fn set_handler(
        &self,
        command: Command,
        handler: impl FnMut(Command, u32, TagStruct) + Send + 'static,
    ) {
        self.inner
            .handlers
            .lock()
            .insert(command as u32, Box::new(handler));
    }

    /// Installs the handler for unknown or untabled commands. It
    /// receives the raw command code.
    pub fn set_fallback(&self, handler: impl FnMut(u32, u32, TagStruct) + Send + 'static) {
        *self.inner.fallback.lock() = Some(Box::new(handler));
    }

    /// Parses and routes one packet.
    pub fn run(&self, packet: &Packet) -> Result<(), WireError> {
        let mut ts = TagStruct::from_packet(packet);
        let command = ts.get_u32()?;
        let tag = ts.get_u32()?;

        match Command::from_wire(command) {
            Some(Command::Reply) => {
                let entry = self.take_pending(tag);
                match entry {
                    Some(tx) => {
                        let _ = tx.send(ReplyEvent::Reply(ts));
                        Ok(())
                    }
                    None => Err(WireError::Malformed(format!(
                        "REPLY for unknown tag {tag}"
                    ))),
                }
            }
            Some(Command::Error) => {
                let code = ErrCode::from_wire(ts.get_u32()?);
                let entry = self.take_pending(tag);
                match entry {
                    Some(tx) => {
                        let _ = tx.send(ReplyEvent::Error(code));
                        Ok(())
                    }
                    None => Err(WireError::Malformed(format!(
                        "ERROR({code}) for unknown tag {tag}"
                    ))),
                }
            }
            other => {
                // Take the handler out for the duration of the call so
                // handlers may touch the dispatcher again.
                let handler = self.inner.handlers.lock().remove(&command);
                match (other, handler) {
                    (Some(cmd), Some(mut h)) => {
                        h(cmd, tag, ts);
                        self.inner
                            .handlers
                            .lock()
                            .entry(command)
                            .or_insert(h);
                        Ok(())
                    }
                    _ => {
                        let fb = self.inner.fallback.lock().take();
                        match fb {
                            Some(mut fb) => {
                                fb(command, tag, ts);
                                let mut slot = self.inner.fallback.lock();
                                if slot.is_none() {
                                    *slot = Some(fb);
                                }
                                Ok(())
                            }
                            None => Err(WireError::Malformed(format!(
                                "unknown command {command}"
                            ))),
                        }
                    }
                }
            }
        }
    }

    /// Registers an outstanding request. The returned receiver yields
    /// exactly one [`ReplyEvent`]; after `timeout` with no reply it is
    /// a synthetic `Timeout`.
    pub fn register_reply(&self, tag: u32, timeout: Duration) -> oneshot::Receiver<ReplyEvent> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(tag, tx);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = this.take_pending(tag) {
                warn!("request tag {} timed out after {:?}", tag, timeout);
                let _ = tx.send(ReplyEvent::Timeout);
            }
        });
        rx
    }

    /// True while any reply is outstanding.
    pub fn is_pending(&self) -> bool {
        !self.inner.pending.lock().is_empty()
    }

    /// Resolves once no replies are outstanding (immediately if none).
    pub async fn wait_drain(&self) {
        let rx = {
            let pending = self.inner.pending.lock();
            if pending.is_empty() {
                return;
            }
            let (tx, rx) = oneshot::channel();
            self.inner.drain_waiters.lock().push(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Fails every outstanding request, for a dying stream.
    pub fn fail_all(&self) {
        let entries: Vec<_> = self.inner.pending.lock().drain().collect();
        for (_, tx) in entries {
            let _ = tx.send(ReplyEvent::Died);
        }
        self.notify_drained();
    }

    fn take_pending(&self, tag: u32) -> Option<oneshot::Sender<ReplyEvent>> {
        let entry = self.inner.pending.lock().remove(&tag);
        if entry.is_some() && self.inner.pending.lock().is_empty() {
            self.notify_drained();
        }
        entry
    }

    fn notify_drained(&self) {
        for tx in self.inner.drain_waiters.lock().drain(..) {
            let _ = tx.send(());
        }
    }
}

impl Default for PDispatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn packet(f: impl FnOnce(&mut TagStruct)) -> Packet {
        let mut ts = TagStruct::new();
        f(&mut ts);
        ts.into_packet()
    }

    #[tokio::test]
    async fn reply_reaches_registered_request() {
        let pd = PDispatch::new();
        let rx = pd.register_reply(7, Duration::from_secs(5));
        assert!(pd.is_pending());
        pd.run(&packet(|ts| {
            ts.put_u32(Command::Reply as u32).put_u32(7).put_u32(99);
        }))
        .unwrap();
        match rx.await.unwrap() {
            ReplyEvent::Reply(mut ts) => assert_eq!(ts.get_u32().unwrap(), 99),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!pd.is_pending());
    }

    #[tokio::test]
    async fn error_carries_code() {
        let pd = PDispatch::new();
        let rx = pd.register_reply(1, Duration::from_secs(5));
        pd.run(&packet(|ts| {
            ts.put_u32(Command::Error as u32)
                .put_u32(1)
                .put_u32(ErrCode::Access as u32);
        }))
        .unwrap();
        match rx.await.unwrap() {
            ReplyEvent::Error(code) => assert_eq!(code, ErrCode::Access),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmatched_reply_is_an_error() {
        let pd = PDispatch::new();
        let r = pd.run(&packet(|ts| {
            ts.put_u32(Command::Reply as u32).put_u32(42);
        }));
        assert!(r.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_fires_promptly() {
        let pd = PDispatch::new();
        let rx = pd.register_reply(3, Duration::ZERO);
        match rx.await.unwrap() {
            ReplyEvent::Timeout => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(!pd.is_pending());
    }

    #[tokio::test]
    async fn command_goes_through_table() {
        let pd = PDispatch::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h2 = hits.clone();
        pd.set_handler(Command::Auth, move |cmd, tag, _ts| {
            assert_eq!(cmd, Command::Auth);
            assert_eq!(tag, 5);
            h2.fetch_add(1, Ordering::SeqCst);
        });
        pd.run(&packet(|ts| {
            ts.put_u32(Command::Auth as u32).put_u32(5);
        }))
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_command_hits_fallback() {
        let pd = PDispatch::new();
        let seen = Arc::new(AtomicU32::new(0));
        let s2 = seen.clone();
        pd.set_fallback(move |raw, _tag, _ts| {
            s2.store(raw, Ordering::SeqCst);
        });
        pd.run(&packet(|ts| {
            ts.put_u32(59).put_u32(1);
        }))
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 59);
    }

    #[tokio::test]
    async fn drain_and_fail_all() {
        let pd = PDispatch::new();
        let rx = pd.register_reply(9, Duration::from_secs(30));
        let pd2 = pd.clone();
        let waiter = tokio::spawn(async move { pd2.wait_drain().await });
        pd.fail_all();
        match rx.await.unwrap() {
            ReplyEvent::Died => {}
            other => panic!("unexpected {other:?}"),
        }
        waiter.await.unwrap();
        // No replies outstanding, no timer armed: nothing pending.
        assert!(!pd.is_pending());
        pd.wait_drain().await;
    }
}

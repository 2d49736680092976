//! Thread IO dédié d'un sink ou d'une source.
//!
//! Chaque thread héberge un runtime tokio mono-thread et exécute la
//! boucle fournie par le pilote. L'identité du thread est stable pour
//! toute la durée de vie de l'objet ; l'arrêt passe par le message de
//! contrôle `MSG_SHUTDOWN` suivi d'un join.

use std::future::Future;
use std::thread;

use tracing::{debug, error};

use crate::asyncmsgq::{AsyncMsgQ, AsyncMsgQReceiver, MSG_SHUTDOWN};
use crate::error::LoopError;

/// Un thread IO et sa file de messages entrante.
pub struct IoThread {
    name: String,
    msgq: AsyncMsgQ,
    handle: Option<thread::JoinHandle<()>>,
}

impl IoThread {
    /// Démarre le thread. `body` reçoit le récepteur de la file et
    /// tourne jusqu'à l'arrêt ; il doit traiter `MSG_SHUTDOWN`.
    pub fn spawn<F, Fut>(name: &str, body: F) -> Result<IoThread, LoopError>
    where
        F: FnOnce(AsyncMsgQReceiver) -> Fut + Send + 'static,
        Fut: Future<Output = ()>,
    {
        let (msgq, rx) = AsyncMsgQ::new();
        let thread_name = name.to_owned();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("io thread {}: runtime build failed: {}", thread_name, e);
                        return;
                    }
                };
                debug!("io thread {} up", thread_name);
                rt.block_on(body(rx));
                debug!("io thread {} down", thread_name);
            })
            .map_err(|e| LoopError::Spawn(e.to_string()))?;
        Ok(IoThread {
            name: name.to_owned(),
            msgq,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// File d'entrée du thread (côté émetteur).
    pub fn msgq(&self) -> &AsyncMsgQ {
        &self.msgq
    }

    /// Demande l'arrêt et attend la fin du thread.
    pub fn shutdown(mut self) {
        let _ = self.msgq.post_control(MSG_SHUTDOWN);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("io thread {} panicked", self.name);
            }
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        // Filet : un drop sans shutdown explicite arrête quand même le
        // thread proprement.
        if let Some(handle) = self.handle.take() {
            let _ = self.msgq.post_control(MSG_SHUTDOWN);
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtpoll::{RtPoll, Wakeup};

    #[tokio::test]
    async fn spawn_process_shutdown() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let count = Arc::new(AtomicU32::new(0));
        let c2 = count.clone();
        let io = IoThread::spawn("test-io", move |rx| async move {
            let mut poll = RtPoll::new();
            poll.attach_msgq(rx);
            loop {
                match poll.run().await {
                    Ok(Wakeup::Msg(msg)) => {
                        if msg.is_shutdown() {
                            break;
                        }
                        c2.fetch_add(msg.code, Ordering::SeqCst);
                        msg.dispatch().await;
                    }
                    Ok(Wakeup::Quit) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .unwrap();

        io.msgq().post_control(3).unwrap();
        io.msgq().post_control(4).unwrap();
        io.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 7);
    }
}

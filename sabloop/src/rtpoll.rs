//! Boucle de poll des threads IO.
//!
//! Un [`RtPoll`] multiplexe trois familles de sources : la file de
//! messages inter-threads, des descripteurs surveillés et un timer à
//! échéance absolue. [`RtPoll::run`] bloque jusqu'au premier événement
//! et le retourne ; le thread IO décide alors quoi en faire (rendu,
//! dispatch de message, arrêt).
//!
//! Les items fd sont servis dans l'ordre (classe de priorité,
//! insertion) : à réveil multiple, c'est l'item le mieux classé qui
//! est rendu. La file de messages passe toujours avant les fds, le
//! timer après.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::asyncmsgq::{AsyncMsgQReceiver, Message};
use crate::error::LoopError;
use crate::mainloop::IoEventFlags;

/// Classe de priorité d'un item fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PollPriority {
    Early,
    Normal,
    Late,
}

/// Sémaphore de réveil inter-threads (poste → réveille un run).
///
/// Contrairement à un simple notify, les posts sont comptés : un
/// post émis pendant que le thread IO travaille n'est pas perdu.
#[derive(Clone)]
pub struct FdSem {
    sem: Arc<Semaphore>,
}

impl FdSem {
    pub fn new() -> Self {
        FdSem {
            sem: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn post(&self) {
        self.sem.add_permits(1);
    }

    pub async fn wait(&self) {
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }

    pub fn try_wait(&self) -> bool {
        match self.sem.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }
}

impl Default for FdSem {
    fn default() -> Self {
        Self::new()
    }
}

struct RawFdHolder(RawFd);

impl AsRawFd for RawFdHolder {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct FdItem {
    id: usize,
    priority: PollPriority,
    afd: AsyncFd<RawFdHolder>,
    interest: IoEventFlags,
}

/// Événement rendu par [`RtPoll::run`].
pub enum Wakeup {
    /// Le timer absolu est arrivé à échéance (et a été désarmé).
    Timer,
    /// Un message est arrivé sur la file attachée.
    Msg(Message),
    /// L'item fd `id` est prêt avec ces événements.
    Io(usize, IoEventFlags),
    /// Le sémaphore attaché a été posté.
    Sem,
    /// [`RtPoll::quit`] a été appelé, ou la file de messages est morte.
    Quit,
}

impl std::fmt::Debug for Wakeup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Wakeup::Timer => write!(f, "Timer"),
            Wakeup::Msg(m) => write!(f, "Msg({})", m.code),
            Wakeup::Io(id, fl) => write!(f, "Io({id}, {fl:?})"),
            Wakeup::Sem => write!(f, "Sem"),
            Wakeup::Quit => write!(f, "Quit"),
        }
    }
}

/// La boucle de poll d'un thread IO.
///
/// Construite et utilisée sur le thread qu'elle pilote ; elle n'est
/// pas partageable.
pub struct RtPoll {
    msgq: Option<AsyncMsgQReceiver>,
    sem: Option<FdSem>,
    items: Vec<FdItem>,
    next_id: usize,
    timer: Option<Instant>,
    timer_elapsed: bool,
    quit: bool,
}

impl RtPoll {
    pub fn new() -> Self {
        RtPoll {
            msgq: None,
            sem: None,
            items: Vec::new(),
            next_id: 0,
            timer: None,
            timer_elapsed: false,
            quit: false,
        }
    }

    /// Attache la file de messages ; ses messages réveillent `run`.
    pub fn attach_msgq(&mut self, rx: AsyncMsgQReceiver) {
        self.msgq = Some(rx);
    }

    /// Attache un sémaphore de réveil.
    pub fn attach_sem(&mut self, sem: FdSem) {
        self.sem = Some(sem);
    }

    /// Surveille un descripteur. Retourne l'identifiant de l'item.
    ///
    /// Le descripteur doit être non bloquant et rester valide tant que
    /// l'item n'est pas retiré.
    pub fn add_fd(
        &mut self,
        fd: RawFd,
        interest: IoEventFlags,
        priority: PollPriority,
    ) -> Result<usize, LoopError> {
        let afd = AsyncFd::with_interest(
            RawFdHolder(fd),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let id = self.next_id;
        self.next_id += 1;
        let pos = self
            .items
            .iter()
            .position(|it| it.priority > priority)
            .unwrap_or(self.items.len());
        self.items.insert(
            pos,
            FdItem {
                id,
                priority,
                afd,
                interest,
            },
        );
        Ok(id)
    }

    pub fn remove_fd(&mut self, id: usize) {
        self.items.retain(|it| it.id != id);
    }

    pub fn set_fd_interest(&mut self, id: usize, interest: IoEventFlags) {
        if let Some(it) = self.items.iter_mut().find(|it| it.id == id) {
            it.interest = interest;
        }
    }

    /// Arme le timer à une échéance absolue.
    pub fn set_timer_absolute(&mut self, t: Instant) {
        self.timer = Some(t);
    }

    pub fn set_timer_disabled(&mut self) {
        self.timer = None;
    }

    /// Vrai si le dernier `run` s'est réveillé sur l'échéance du timer.
    pub fn timer_elapsed(&self) -> bool {
        self.timer_elapsed
    }

    /// Fait retourner `Quit` au prochain `run`.
    pub fn quit(&mut self) {
        self.quit = true;
    }

    /// Bloque jusqu'au prochain événement.
    pub async fn run(&mut self) -> Result<Wakeup, LoopError> {
        self.timer_elapsed = false;
        if self.quit {
            return Ok(Wakeup::Quit);
        }

        let deadline = self.timer;
        let items = &self.items;
        let msgq = self.msgq.as_mut();
        let has_msgq = msgq.is_some();
        let sem = self.sem.clone();

        let wakeup = tokio::select! {
            biased;
            msg = recv_opt(msgq), if has_msgq => match msg {
                Some(m) => Wakeup::Msg(m),
                // Tous les émetteurs ont disparu : le thread n'a plus
                // de raison de vivre.
                None => Wakeup::Quit,
            },
            _ = sem_wait(&sem), if sem.is_some() => Wakeup::Sem,
            (id, flags) = poll_items(items), if !items.is_empty() => Wakeup::Io(id, flags),
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                Wakeup::Timer
            }
            else => Wakeup::Quit,
        };

        if let Wakeup::Timer = wakeup {
            self.timer = None;
            self.timer_elapsed = true;
        }
        if let Wakeup::Quit = wakeup {
            self.quit = true;
        }
        Ok(wakeup)
    }
}

impl Default for RtPoll {
    fn default() -> Self {
        Self::new()
    }
}

async fn recv_opt(msgq: Option<&mut AsyncMsgQReceiver>) -> Option<Message> {
    match msgq {
        Some(rx) => rx.recv().await,
        None => {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }
}

async fn sem_wait(sem: &Option<FdSem>) {
    match sem {
        Some(s) => s.wait().await,
        None => futures::future::pending().await,
    }
}

/// Attend le premier item prêt, par ordre de classement.
async fn poll_items(items: &[FdItem]) -> (usize, IoEventFlags) {
    use futures::future::select_all;
    if items.is_empty() {
        futures::future::pending::<()>().await;
        unreachable!();
    }
    let futs: Vec<_> = items
        .iter()
        .map(|it| {
            Box::pin(async move {
                let interest = match (
                    it.interest.contains(IoEventFlags::INPUT),
                    it.interest.contains(IoEventFlags::OUTPUT),
                ) {
                    (true, true) => Interest::READABLE | Interest::WRITABLE,
                    (true, false) => Interest::READABLE,
                    (false, true) => Interest::WRITABLE,
                    (false, false) => {
                        futures::future::pending::<()>().await;
                        unreachable!();
                    }
                };
                match it.afd.ready(interest).await {
                    Ok(mut guard) => {
                        let ready = guard.ready();
                        let mut flags = IoEventFlags::empty();
                        if ready.is_readable() {
                            flags |= IoEventFlags::INPUT;
                        }
                        if ready.is_writable() {
                            flags |= IoEventFlags::OUTPUT;
                        }
                        if ready.is_read_closed() || ready.is_write_closed() {
                            flags |= IoEventFlags::HANGUP;
                        }
                        guard.clear_ready();
                        (it.id, flags)
                    }
                    Err(_) => (it.id, IoEventFlags::ERROR),
                }
            })
        })
        .collect();
    let ((id, flags), _, _) = select_all(futs).await;
    (id, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asyncmsgq::AsyncMsgQ;
    use std::time::Duration;

    #[tokio::test]
    async fn timer_wakeup_sets_elapsed() {
        let mut poll = RtPoll::new();
        poll.set_timer_absolute(Instant::now() + Duration::from_millis(5));
        let w = poll.run().await.unwrap();
        assert!(matches!(w, Wakeup::Timer));
        assert!(poll.timer_elapsed());
        // Le timer est à un coup.
        poll.quit();
        assert!(matches!(poll.run().await.unwrap(), Wakeup::Quit));
    }

    #[tokio::test]
    async fn msgq_wakes_before_timer() {
        let (q, rx) = AsyncMsgQ::new();
        let mut poll = RtPoll::new();
        poll.attach_msgq(rx);
        poll.set_timer_absolute(Instant::now() + Duration::from_secs(10));
        q.post_control(42).unwrap();
        match poll.run().await.unwrap() {
            Wakeup::Msg(m) => assert_eq!(m.code, 42),
            other => panic!("expected Msg, got {other:?}"),
        }
        assert!(!poll.timer_elapsed());
    }

    #[tokio::test]
    async fn closed_msgq_means_quit() {
        let (q, rx) = AsyncMsgQ::new();
        let mut poll = RtPoll::new();
        poll.attach_msgq(rx);
        drop(q);
        assert!(matches!(poll.run().await.unwrap(), Wakeup::Quit));
    }

    #[tokio::test]
    async fn sem_post_wakes() {
        let sem = FdSem::new();
        let mut poll = RtPoll::new();
        poll.attach_sem(sem.clone());
        sem.post();
        assert!(matches!(poll.run().await.unwrap(), Wakeup::Sem));
    }

    #[tokio::test]
    async fn fd_item_readiness() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let mut poll = RtPoll::new();
        let id = poll
            .add_fd(b.as_raw_fd(), IoEventFlags::INPUT, PollPriority::Normal)
            .unwrap();
        a.write_all(b"!").unwrap();
        match poll.run().await.unwrap() {
            Wakeup::Io(got, flags) => {
                assert_eq!(got, id);
                assert!(flags.contains(IoEventFlags::INPUT));
            }
            other => panic!("expected Io, got {other:?}"),
        }
    }
}

//! Boucle principale abstraite : sources IO, timers, différés, quit.
//!
//! Tous les callbacks s'exécutent sur le thread qui appelle
//! [`Mainloop::run`] ; l'implémentation est strictement mono-thread
//! (les handles ne sont pas `Send`). Les descripteurs surveillés
//! doivent être non bloquants ; leur durée de vie reste à la charge de
//! l'appelant, la boucle n'en prend jamais possession.
//!
//! Les timers sont à échéance absolue (horloge monotone) et à un coup :
//! le callback peut retourner une nouvelle échéance pour se réarmer.
//! Détruire un handle annule sa source ; aucun callback n'est invoqué
//! après l'annulation.

use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::time::Instant;

bitflags::bitflags! {
    /// Événements d'une source IO.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoEventFlags: u32 {
        const INPUT = 0x1;
        const OUTPUT = 0x2;
        const HANGUP = 0x4;
        const ERROR = 0x8;
    }
}

struct RawFdHolder(RawFd);

impl AsRawFd for RawFdHolder {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

type IoCb = Box<dyn FnMut(RawFd, IoEventFlags)>;
type TimerCb = Box<dyn FnMut() -> Option<Instant>>;
type DeferCb = Box<dyn FnMut()>;
type SignalCb = Box<dyn FnMut(i32)>;

struct IoSource {
    fd: RawFd,
    afd: RefCell<Option<AsyncFd<RawFdHolder>>>,
    interest: Cell<IoEventFlags>,
    cb: RefCell<Option<IoCb>>,
    dead: Cell<bool>,
}

struct TimerSource {
    deadline: Cell<Option<Instant>>,
    cb: RefCell<Option<TimerCb>>,
    dead: Cell<bool>,
}

struct DeferSource {
    enabled: Cell<bool>,
    cb: RefCell<Option<DeferCb>>,
    dead: Cell<bool>,
}

struct SignalSource {
    signum: i32,
    stream: RefCell<tokio::signal::unix::Signal>,
    cb: RefCell<Option<SignalCb>>,
    dead: Cell<bool>,
}

enum Source {
    Io(Rc<IoSource>),
    Timer(Rc<TimerSource>),
    Defer(Rc<DeferSource>),
    Signal(Rc<SignalSource>),
}

impl Source {
    fn is_dead(&self) -> bool {
        match self {
            Source::Io(s) => s.dead.get(),
            Source::Timer(s) => s.dead.get(),
            Source::Defer(s) => s.dead.get(),
            Source::Signal(s) => s.dead.get(),
        }
    }
}

struct Inner {
    sources: RefCell<Vec<Source>>,
    quit: Cell<Option<i32>>,
}

/// La boucle principale. Clonable (toutes les copies partagent l'état).
#[derive(Clone)]
pub struct Mainloop {
    inner: Rc<Inner>,
}

/// Handle d'une source IO ; détruire le handle annule la source.
pub struct IoHandle {
    source: Rc<IoSource>,
}

impl IoHandle {
    /// Change le masque d'événements surveillés.
    pub fn set_events(&self, events: IoEventFlags) {
        self.source.interest.set(events);
    }
}

impl Drop for IoHandle {
    fn drop(&mut self) {
        self.source.dead.set(true);
        self.source.cb.borrow_mut().take();
    }
}

/// Handle d'un timer ; détruire le handle annule l'échéance.
pub struct TimerHandle {
    source: Rc<TimerSource>,
}

impl TimerHandle {
    /// Réarme le timer à une nouvelle échéance absolue.
    pub fn restart(&self, deadline: Instant) {
        self.source.deadline.set(Some(deadline));
    }

    pub fn disable(&self) {
        self.source.deadline.set(None);
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.source.dead.set(true);
        self.source.cb.borrow_mut().take();
    }
}

/// Handle d'un événement différé.
pub struct DeferHandle {
    source: Rc<DeferSource>,
}

impl DeferHandle {
    pub fn enable(&self, on: bool) {
        self.source.enabled.set(on);
    }
}

impl Drop for DeferHandle {
    fn drop(&mut self) {
        self.source.dead.set(true);
        self.source.cb.borrow_mut().take();
    }
}

/// Handle d'une source signal.
pub struct SignalHandle {
    source: Rc<SignalSource>,
}

impl Drop for SignalHandle {
    fn drop(&mut self) {
        self.source.dead.set(true);
        self.source.cb.borrow_mut().take();
    }
}

impl Mainloop {
    pub fn new() -> Self {
        Mainloop {
            inner: Rc::new(Inner {
                sources: RefCell::new(Vec::new()),
                quit: Cell::new(None),
            }),
        }
    }

    /// Surveille `fd` pour `events`. Le callback reçoit le fd et les
    /// événements actifs.
    pub fn io_event(
        &self,
        fd: RawFd,
        events: IoEventFlags,
        cb: impl FnMut(RawFd, IoEventFlags) + 'static,
    ) -> IoHandle {
        let source = Rc::new(IoSource {
            fd,
            afd: RefCell::new(None),
            interest: Cell::new(events),
            cb: RefCell::new(Some(Box::new(cb))),
            dead: Cell::new(false),
        });
        self.inner.sources.borrow_mut().push(Source::Io(source.clone()));
        IoHandle { source }
    }

    /// Programme un timer à échéance absolue. Le callback peut
    /// retourner une nouvelle échéance pour se réarmer.
    pub fn timer_event(
        &self,
        deadline: Instant,
        cb: impl FnMut() -> Option<Instant> + 'static,
    ) -> TimerHandle {
        let source = Rc::new(TimerSource {
            deadline: Cell::new(Some(deadline)),
            cb: RefCell::new(Some(Box::new(cb))),
            dead: Cell::new(false),
        });
        self.inner
            .sources
            .borrow_mut()
            .push(Source::Timer(source.clone()));
        TimerHandle { source }
    }

    /// Enregistre un événement différé, activé d'emblée. Les différés
    /// actifs sont tous exécutés avant tout retour au poll.
    pub fn defer_event(&self, cb: impl FnMut() + 'static) -> DeferHandle {
        let source = Rc::new(DeferSource {
            enabled: Cell::new(true),
            cb: RefCell::new(Some(Box::new(cb))),
            dead: Cell::new(false),
        });
        self.inner
            .sources
            .borrow_mut()
            .push(Source::Defer(source.clone()));
        DeferHandle { source }
    }

    /// Pont signal : délivre `signum` comme un événement de la boucle.
    pub fn signal_event(
        &self,
        signum: i32,
        cb: impl FnMut(i32) + 'static,
    ) -> std::io::Result<SignalHandle> {
        let kind = tokio::signal::unix::SignalKind::from_raw(signum);
        let stream = tokio::signal::unix::signal(kind)?;
        let source = Rc::new(SignalSource {
            signum,
            stream: RefCell::new(stream),
            cb: RefCell::new(Some(Box::new(cb))),
            dead: Cell::new(false),
        });
        self.inner
            .sources
            .borrow_mut()
            .push(Source::Signal(source.clone()));
        Ok(SignalHandle { source })
    }

    /// Demande l'arrêt de [`Mainloop::run`] avec `retval`.
    pub fn quit(&self, retval: i32) {
        self.inner.quit.set(Some(retval));
    }

    /// Exécute la boucle jusqu'à [`Mainloop::quit`]. Retourne le code
    /// passé à `quit`.
    pub async fn run(&self) -> i32 {
        loop {
            if let Some(code) = self.run_once().await {
                return code;
            }
        }
    }

    /// Une itération : différés, puis attente d'un événement.
    /// Retourne `Some(code)` si `quit` a été demandé.
    pub async fn run_once(&self) -> Option<i32> {
        self.sweep_dead();
        self.dispatch_defer();
        if let Some(code) = self.inner.quit.get() {
            return Some(code);
        }

        let (ios, timers, signals) = self.snapshot();

        // Échéance la plus proche parmi les timers armés.
        let deadline = timers
            .iter()
            .filter_map(|t| t.deadline.get())
            .min();

        enum Fired {
            Io(Rc<IoSource>, IoEventFlags),
            Timer,
            Signal(Rc<SignalSource>),
        }

        let io_wait = wait_io(&ios);
        let signal_wait = wait_signal(&signals);

        let fired = tokio::select! {
            biased;
            res = io_wait, if !ios.is_empty() => {
                match res {
                    Some((src, flags)) => Fired::Io(src, flags),
                    None => return self.inner.quit.get(),
                }
            }
            src = signal_wait, if !signals.is_empty() => Fired::Signal(src),
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))), if deadline.is_some() => Fired::Timer,
            // Aucune source prête et rien d'armé : la boucle dort par
            // tranches pour rester réactive aux différés réactivés
            // depuis un callback précédent.
            _ = tokio::time::sleep(Duration::from_millis(50)), if deadline.is_none() && ios.is_empty() && signals.is_empty() => Fired::Timer,
        };

        match fired {
            Fired::Io(src, flags) => {
                if !src.dead.get() {
                    let cb = src.cb.borrow_mut().take();
                    if let Some(mut cb) = cb {
                        cb(src.fd, flags);
                        if src.cb.borrow().is_none() && !src.dead.get() {
                            *src.cb.borrow_mut() = Some(cb);
                        }
                    }
                }
            }
            Fired::Signal(src) => {
                if !src.dead.get() {
                    let cb = src.cb.borrow_mut().take();
                    if let Some(mut cb) = cb {
                        cb(src.signum);
                        if src.cb.borrow().is_none() && !src.dead.get() {
                            *src.cb.borrow_mut() = Some(cb);
                        }
                    }
                }
            }
            Fired::Timer => {
                let now = Instant::now();
                for t in &timers {
                    if t.dead.get() {
                        continue;
                    }
                    if t.deadline.get().map(|d| d <= now).unwrap_or(false) {
                        // Un coup : l'échéance est consommée avant le
                        // callback, qui peut réarmer.
                        t.deadline.set(None);
                        let cb = t.cb.borrow_mut().take();
                        if let Some(mut cb) = cb {
                            if let Some(next) = cb() {
                                t.deadline.set(Some(next));
                            }
                            if t.cb.borrow().is_none() && !t.dead.get() {
                                *t.cb.borrow_mut() = Some(cb);
                            }
                        }
                    }
                }
            }
        }

        self.inner.quit.get()
    }

    fn snapshot(&self) -> (Vec<Rc<IoSource>>, Vec<Rc<TimerSource>>, Vec<Rc<SignalSource>>) {
        let sources = self.inner.sources.borrow();
        let mut ios = Vec::new();
        let mut timers = Vec::new();
        let mut signals = Vec::new();
        for s in sources.iter() {
            match s {
                Source::Io(io) if !io.dead.get() => ios.push(io.clone()),
                Source::Timer(t) if !t.dead.get() => timers.push(t.clone()),
                Source::Signal(sg) if !sg.dead.get() => signals.push(sg.clone()),
                _ => {}
            }
        }
        (ios, timers, signals)
    }

    fn dispatch_defer(&self) {
        // Tous les différés actifs sont servis avant le poll, y
        // compris ceux activés par un différé précédent.
        loop {
            let ready: Vec<Rc<DeferSource>> = {
                let sources = self.inner.sources.borrow();
                sources
                    .iter()
                    .filter_map(|s| match s {
                        Source::Defer(d) if !d.dead.get() && d.enabled.get() => Some(d.clone()),
                        _ => None,
                    })
                    .collect()
            };
            if ready.is_empty() {
                return;
            }
            for d in ready {
                if d.dead.get() || !d.enabled.get() {
                    continue;
                }
                // Un différé reste actif tant qu'on ne le désactive
                // pas ; il est désarmé avant son callback pour ne pas
                // boucler, à charge du callback de le réactiver.
                d.enabled.set(false);
                let cb = d.cb.borrow_mut().take();
                if let Some(mut cb) = cb {
                    cb();
                    if d.cb.borrow().is_none() && !d.dead.get() {
                        *d.cb.borrow_mut() = Some(cb);
                    }
                }
            }
        }
    }

    fn sweep_dead(&self) {
        self.inner.sources.borrow_mut().retain(|s| !s.is_dead());
    }
}

impl Default for Mainloop {
    fn default() -> Self {
        Self::new()
    }
}

/// Attend la première source IO prête parmi `ios`.
async fn wait_io(ios: &[Rc<IoSource>]) -> Option<(Rc<IoSource>, IoEventFlags)> {
    use futures::future::select_all;
    if ios.is_empty() {
        futures::future::pending::<()>().await;
        unreachable!();
    }
    let futs: Vec<_> = ios
        .iter()
        .cloned()
        .map(|src| {
            Box::pin(async move {
                let interest = to_interest(src.interest.get());
                let Some(interest) = interest else {
                    futures::future::pending::<()>().await;
                    unreachable!();
                };
                if src.afd.borrow().is_none() {
                    match AsyncFd::with_interest(RawFdHolder(src.fd), Interest::READABLE | Interest::WRITABLE) {
                        Ok(afd) => *src.afd.borrow_mut() = Some(afd),
                        Err(_) => {
                            return (src.clone(), IoEventFlags::ERROR);
                        }
                    }
                }
                let flags = {
                    let afd = src.afd.borrow();
                    let afd = afd.as_ref().unwrap();
                    match afd.ready(interest).await {
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
                            flags
                        }
                        Err(_) => IoEventFlags::ERROR,
                    }
                };
                (src.clone(), flags)
            })
        })
        .collect();
    let ((src, flags), _, _) = select_all(futs).await;
    Some((src, flags))
}

/// Attend le premier signal parmi `signals`.
async fn wait_signal(signals: &[Rc<SignalSource>]) -> Rc<SignalSource> {
    use futures::future::select_all;
    if signals.is_empty() {
        futures::future::pending::<()>().await;
        unreachable!();
    }
    let futs: Vec<_> = signals
        .iter()
        .cloned()
        .map(|src| {
            Box::pin(async move {
                src.stream.borrow_mut().recv().await;
                src.clone()
            })
        })
        .collect();
    let (src, _, _) = select_all(futs).await;
    src
}

fn to_interest(flags: IoEventFlags) -> Option<Interest> {
    let r = flags.contains(IoEventFlags::INPUT);
    let w = flags.contains(IoEventFlags::OUTPUT);
    match (r, w) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn quit_stops_run() {
        let ml = Mainloop::new();
        let ml2 = ml.clone();
        let _d = ml.defer_event(move || ml2.quit(7));
        assert_eq!(ml.run().await, 7);
    }

    #[tokio::test]
    async fn defer_runs_before_poll_and_can_rearm() {
        use std::cell::Cell;
        let ml = Mainloop::new();
        let count = Rc::new(Cell::new(0));
        let c2 = count.clone();
        let ml2 = ml.clone();
        let handle = Rc::new(RefCell::new(None));
        let h2 = handle.clone();
        let d = ml.defer_event(move || {
            c2.set(c2.get() + 1);
            if c2.get() == 3 {
                ml2.quit(0);
            } else if let Some(h) = &*h2.borrow() {
                let h: &DeferHandle = h;
                h.enable(true);
            }
        });
        *handle.borrow_mut() = Some(d);
        ml.run().await;
        assert_eq!(count.get(), 3);
    }

    #[tokio::test]
    async fn timer_fires_and_reschedules() {
        use std::cell::Cell;
        let ml = Mainloop::new();
        let fired = Rc::new(Cell::new(0));
        let f2 = fired.clone();
        let ml2 = ml.clone();
        let _t = ml.timer_event(Instant::now(), move || {
            f2.set(f2.get() + 1);
            if f2.get() < 2 {
                Some(Instant::now() + Duration::from_millis(5))
            } else {
                ml2.quit(0);
                None
            }
        });
        ml.run().await;
        assert_eq!(fired.get(), 2);
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let ml = Mainloop::new();
        let t = ml.timer_event(Instant::now(), || panic!("cancelled timer fired"));
        drop(t);
        let ml2 = ml.clone();
        let _t2 = ml.timer_event(Instant::now() + Duration::from_millis(20), move || {
            ml2.quit(0);
            None
        });
        ml.run().await;
    }

    #[tokio::test]
    async fn io_event_sees_readable_fd() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let ml = Mainloop::new();
        let ml2 = ml.clone();
        let fd = b.as_raw_fd();
        let _io = ml.io_event(fd, IoEventFlags::INPUT, move |got_fd, flags| {
            assert_eq!(got_fd, fd);
            assert!(flags.contains(IoEventFlags::INPUT));
            ml2.quit(1);
        });
        a.write_all(b"x").unwrap();
        assert_eq!(ml.run().await, 1);
    }
}

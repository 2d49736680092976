//! # sabloop - Boucles d'événements du serveur audio Sabine
//!
//! Trois mécanismes distincts, tous construits sur tokio :
//!
//! - [`Mainloop`] : la boucle principale abstraite (sources IO, timers,
//!   différés, signaux, quit), mono-thread, qui porte le plan de
//!   contrôle et les clients ;
//! - [`RtPoll`] : la boucle des threads IO des sinks/sources, qui
//!   multiplexe descripteurs, file de messages et timer absolu ;
//! - [`AsyncMsgQ`] : la file de messages inter-threads, seul canal
//!   légal entre plan de contrôle et threads IO.
//!
//! Le pont signaux UNIX → boucle principale est dans [`signal`].

pub mod asyncmsgq;
pub mod error;
pub mod iothread;
pub mod mainloop;
pub mod rtpoll;
pub mod signal;

pub use asyncmsgq::{AsyncMsgQ, AsyncMsgQReceiver, Message, MsgObject, MsgPayload, MSG_SHUTDOWN};
pub use error::LoopError;
pub use iothread::IoThread;
pub use mainloop::{DeferHandle, IoEventFlags, IoHandle, Mainloop, SignalHandle, TimerHandle};
pub use rtpoll::{FdSem, PollPriority, RtPoll, Wakeup};
pub use signal::SignalSet;

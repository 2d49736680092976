//! Pont signaux UNIX → boucle d'événements.
//!
//! Le cas nominal passe par [`Mainloop::signal_event`] : le signal est
//! délivré comme n'importe quelle autre source de la boucle
//! principale. [`SignalSet`] est la variante autonome pour le code qui
//! n'a pas de mainloop (binaire, tests) : elle agrège plusieurs
//! signaux en un seul flux.

use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::error::LoopError;

#[allow(unused_imports)]
use crate::mainloop::Mainloop;

/// Agrégat de flux de signaux.
pub struct SignalSet {
    streams: Vec<(i32, Signal)>,
}

impl SignalSet {
    /// Installe les handlers pour chaque numéro de signal donné.
    pub fn new(signums: &[i32]) -> Result<Self, LoopError> {
        let mut streams = Vec::with_capacity(signums.len());
        for s in signums {
            streams.push((*s, signal(SignalKind::from_raw(*s))?));
        }
        Ok(SignalSet { streams })
    }

    /// Attend le prochain signal et retourne son numéro.
    pub async fn recv(&mut self) -> i32 {
        use futures::future::select_all;
        if self.streams.is_empty() {
            futures::future::pending::<()>().await;
            unreachable!();
        }
        let futs: Vec<_> = self
            .streams
            .iter_mut()
            .map(|(num, stream)| {
                let num = *num;
                Box::pin(async move {
                    stream.recv().await;
                    num
                })
            })
            .collect();
        let (num, _, _) = select_all(futs).await;
        num
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_sigusr1() {
        let mut set = SignalSet::new(&[libc_sigusr1()]).unwrap();
        unsafe {
            libc_raise(libc_sigusr1());
        }
        let got = set.recv().await;
        assert_eq!(got, libc_sigusr1());
    }

    fn libc_sigusr1() -> i32 {
        tokio::signal::unix::SignalKind::user_defined1().as_raw_value()
    }

    unsafe fn libc_raise(sig: i32) {
        extern "C" {
            fn raise(sig: i32) -> i32;
        }
        raise(sig);
    }
}

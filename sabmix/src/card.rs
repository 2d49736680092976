//! Carte : groupe de sinks et de sources partageant un périphérique
//! physique, avec des profils mutuellement exclusifs et un port actif
//! par direction.

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::info;

use sabcore::Proplist;

use crate::core::{Core, EventFacility, EventKind};
use crate::error::MixError;
use crate::sink::Sink;
use crate::source::Source;

/// Un profil de carte : quels ports il active.
#[derive(Debug, Clone)]
pub struct CardProfile {
    pub name: String,
    pub description: String,
    pub sink_port: Option<String>,
    pub source_port: Option<String>,
    pub priority: u32,
}

struct CardState {
    sinks: Vec<Weak<Sink>>,
    sources: Vec<Weak<Source>>,
    active_profile: Option<String>,
    proplist: Proplist,
}

/// Une carte enregistrée dans le cœur.
pub struct Card {
    pub name: String,
    pub profiles: Vec<CardProfile>,
    core: Weak<Core>,
    index: OnceLock<u32>,
    state: Mutex<CardState>,
}

impl Card {
    pub fn new(
        core: &Arc<Core>,
        name: &str,
        profiles: Vec<CardProfile>,
        proplist: Proplist,
    ) -> Arc<Card> {
        let active = profiles
            .iter()
            .max_by_key(|p| p.priority)
            .map(|p| p.name.clone());
        let card = Arc::new(Card {
            name: name.to_owned(),
            profiles,
            core: Arc::downgrade(core),
            index: OnceLock::new(),
            state: Mutex::new(CardState {
                sinks: Vec::new(),
                sources: Vec::new(),
                active_profile: active,
                proplist,
            }),
        });
        let index = core.register_card(&card);
        let _ = card.index.set(index);
        core.emit(EventFacility::Card, EventKind::New, index);
        card
    }

    pub fn idx(&self) -> u32 {
        *self.index.get().unwrap_or(&sabcore::INVALID_INDEX)
    }

    /// Rattache un sink à la carte (en parallèle de l'index du cœur ;
    /// le retrait d'un côté ne libère pas l'autre).
    pub fn adopt_sink(&self, sink: &Arc<Sink>) {
        self.state.lock().sinks.push(Arc::downgrade(sink));
    }

    pub fn adopt_source(&self, source: &Arc<Source>) {
        self.state.lock().sources.push(Arc::downgrade(source));
    }

    pub fn sinks(&self) -> Vec<Arc<Sink>> {
        self.state
            .lock()
            .sinks
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    pub fn sources(&self) -> Vec<Arc<Source>> {
        self.state
            .lock()
            .sources
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    pub fn active_profile(&self) -> Option<String> {
        self.state.lock().active_profile.clone()
    }

    pub fn proplist(&self) -> Proplist {
        self.state.lock().proplist.clone()
    }

    /// Bascule de profil : change le port actif des sinks et sources
    /// de la carte.
    pub fn set_profile(&self, name: &str) -> Result<(), MixError> {
        let profile = self
            .profiles
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| MixError::NoEntity(format!("profile {name}")))?;
        {
            let mut state = self.state.lock();
            if state.active_profile.as_deref() == Some(name) {
                return Ok(());
            }
            state.active_profile = Some(name.to_owned());
        }
        // Seuls les sinks portent un port sélectionnable ; côté
        // capture le profil lui-même fait l'aiguillage.
        if let Some(port) = &profile.sink_port {
            for sink in self.sinks() {
                sink.set_port(port);
            }
        }
        if let Some(core) = self.core.upgrade() {
            core.emit(EventFacility::Card, EventKind::Change, self.idx());
        }
        info!("card {}: profile -> {}", self.name, name);
        Ok(())
    }

    /// Retire la carte des index. Idempotent (le second appel ne
    /// trouve plus rien à retirer).
    pub fn unlink(&self) {
        if let Some(core) = self.core.upgrade() {
            core.unregister_card(self.idx());
            core.emit(EventFacility::Card, EventKind::Remove, self.idx());
        }
    }
}

impl std::fmt::Debug for Card {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Card")
            .field("index", &self.idx())
            .field("name", &self.name)
            .field("active_profile", &self.active_profile())
            .finish()
    }
}

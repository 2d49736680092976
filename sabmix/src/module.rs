//! Module : une extension chargée (sink nul, protocole natif, RTP,
//! RAOP). Le chargement dynamique n'existe pas ; un module est un
//! enregistrement comptable plus un destructeur.

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::info;

use crate::core::{Core, EventFacility, EventKind};

type Unloader = Box<dyn FnOnce() + Send>;

/// Un module enregistré dans le cœur.
pub struct Module {
    pub name: String,
    pub argument: String,
    core: Weak<Core>,
    index: OnceLock<u32>,
    on_unload: Mutex<Option<Unloader>>,
}

impl Module {
    /// Enregistre un module. `on_unload` est appelé une seule fois,
    /// au déchargement.
    pub fn new(
        core: &Arc<Core>,
        name: &str,
        argument: &str,
        on_unload: impl FnOnce() + Send + 'static,
    ) -> Arc<Module> {
        let module = Arc::new(Module {
            name: name.to_owned(),
            argument: argument.to_owned(),
            core: Arc::downgrade(core),
            index: OnceLock::new(),
            on_unload: Mutex::new(Some(Box::new(on_unload))),
        });
        let index = core.register_module(&module);
        let _ = module.index.set(index);
        core.emit(EventFacility::Module, EventKind::New, index);
        info!("module {} loaded as #{index} ({})", name, argument);
        module
    }

    pub fn idx(&self) -> u32 {
        *self.index.get().unwrap_or(&sabcore::INVALID_INDEX)
    }

    /// Nombre d'objets du cœur appartenant à ce module.
    pub fn used_by(&self) -> usize {
        let Some(core) = self.core.upgrade() else {
            return 0;
        };
        let idx = Some(self.idx());
        core.sinks().iter().filter(|s| s.owner_module == idx).count()
            + core
                .sources()
                .iter()
                .filter(|s| s.owner_module == idx)
                .count()
            + core
                .sink_inputs()
                .iter()
                .filter(|i| i.owner_module == idx)
                .count()
    }

    /// Remplace le destructeur. Utile quand les ressources du module
    /// ne sont construites qu'après son enregistrement (elles ont
    /// besoin de son indice). Sans effet sur un module déjà déchargé.
    pub fn replace_unloader(&self, f: Box<dyn FnOnce() + Send>) {
        let mut slot = self.on_unload.lock();
        if slot.is_some() {
            *slot = Some(f);
        }
    }

    /// Décharge le module : destructeur puis retrait des index.
    /// Idempotent.
    pub fn unload(&self) {
        let unloader = self.on_unload.lock().take();
        let Some(unloader) = unloader else {
            return;
        };
        unloader();
        if let Some(core) = self.core.upgrade() {
            core.unregister_module(self.idx());
            core.emit(EventFacility::Module, EventKind::Remove, self.idx());
        }
        info!("module {} (#{}) unloaded", self.name, self.idx());
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("index", &self.idx())
            .field("name", &self.name)
            .finish()
    }
}

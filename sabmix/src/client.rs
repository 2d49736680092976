//! Client : un pair du protocole connecté au serveur.

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::info;

use sabcore::Proplist;

use crate::core::{Core, EventFacility, EventKind};

/// Un client enregistré dans le cœur. Il possède sa proplist ; ses
/// flux le référencent par indice.
pub struct Client {
    pub driver: String,
    pub owner_module: Option<u32>,
    core: Weak<Core>,
    index: OnceLock<u32>,
    state: Mutex<ClientState>,
}

struct ClientState {
    proplist: Proplist,
    linked: bool,
}

impl Client {
    pub fn new(core: &Arc<Core>, driver: &str, proplist: Proplist) -> Arc<Client> {
        let client = Arc::new(Client {
            driver: driver.to_owned(),
            owner_module: None,
            core: Arc::downgrade(core),
            index: OnceLock::new(),
            state: Mutex::new(ClientState {
                proplist,
                linked: true,
            }),
        });
        let index = core.register_client(&client);
        let _ = client.index.set(index);
        core.emit(EventFacility::Client, EventKind::New, index);
        client
    }

    pub fn idx(&self) -> u32 {
        *self.index.get().unwrap_or(&sabcore::INVALID_INDEX)
    }

    pub fn name(&self) -> String {
        let state = self.state.lock();
        state
            .proplist
            .get_str(sabcore::proplist::keys::APPLICATION_NAME)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("client-{}", state.proplist.digest()))
    }

    pub fn proplist(&self) -> Proplist {
        self.state.lock().proplist.clone()
    }

    pub fn update_proplist(&self, mode: sabcore::UpdateMode, p: &Proplist) {
        self.state.lock().proplist.update(mode, p);
        if let Some(core) = self.core.upgrade() {
            core.emit(EventFacility::Client, EventKind::Change, self.idx());
        }
    }

    /// Retire le client des index. Ses flux sont tués par l'appelant
    /// (la connexion protocole qui le possède).
    pub fn unlink(&self) {
        {
            let mut state = self.state.lock();
            if !state.linked {
                return;
            }
            state.linked = false;
        }
        if let Some(core) = self.core.upgrade() {
            core.unregister_client(self.idx());
            core.emit(EventFacility::Client, EventKind::Remove, self.idx());
        }
        info!("client #{} ({}) gone", self.idx(), self.name());
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("index", &self.idx())
            .field("name", &self.name())
            .finish()
    }
}

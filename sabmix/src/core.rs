//! Le cœur : propriétaire de tous les objets du serveur.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use sabcore::{IdxSet, MemPool};

use crate::card::Card;
use crate::client::Client;
use crate::hook::Hook;
use crate::module::Module;
use crate::sink::Sink;
use crate::sink_input::SinkInput;
use crate::source::Source;
use crate::source_output::SourceOutput;

/// Famille d'objets concernée par un événement d'abonnement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventFacility {
    Sink = 0,
    Source = 1,
    SinkInput = 2,
    SourceOutput = 3,
    Module = 4,
    Client = 5,
    Card = 6,
    Server = 7,
}

/// Nature d'un événement d'abonnement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    New = 0,
    Change = 1,
    Remove = 2,
}

/// Un événement de changement d'objet, diffusé aux abonnés du
/// protocole natif.
#[derive(Debug, Clone, Copy)]
pub struct ChangeEvent {
    pub facility: EventFacility,
    pub kind: EventKind,
    pub index: u32,
}

/// Hooks de cycle de vie offerts aux modules.
#[derive(Default)]
pub struct CoreHooks {
    pub sink_put: Hook<Arc<Sink>>,
    pub sink_unlink: Hook<Arc<Sink>>,
    pub source_put: Hook<Arc<Source>>,
    pub source_unlink: Hook<Arc<Source>>,
    pub sink_input_put: Hook<Arc<SinkInput>>,
    pub sink_input_unlink: Hook<Arc<SinkInput>>,
    /// Tous les événements d'abonnement (familles confondues).
    pub events: Hook<ChangeEvent>,
}

struct CoreState {
    sinks: IdxSet<Arc<Sink>>,
    sources: IdxSet<Arc<Source>>,
    sink_inputs: IdxSet<Arc<SinkInput>>,
    source_outputs: IdxSet<Arc<SourceOutput>>,
    clients: IdxSet<Arc<Client>>,
    cards: IdxSet<Arc<Card>>,
    modules: IdxSet<Arc<Module>>,
    default_sink: Option<String>,
    default_source: Option<String>,
}

/// Le graphe d'objets du serveur. Toutes les références fortes des
/// objets enregistrés vivent ici ; les objets pointent en retour vers
/// le cœur par référence faible.
pub struct Core {
    pub pool: MemPool,
    pub hooks: CoreHooks,
    state: Mutex<CoreState>,
}

impl Core {
    pub fn new(pool: MemPool) -> Arc<Core> {
        Arc::new(Core {
            pool,
            hooks: CoreHooks::default(),
            state: Mutex::new(CoreState {
                sinks: IdxSet::new(),
                sources: IdxSet::new(),
                sink_inputs: IdxSet::new(),
                source_outputs: IdxSet::new(),
                clients: IdxSet::new(),
                cards: IdxSet::new(),
                modules: IdxSet::new(),
                default_sink: None,
                default_source: None,
            }),
        })
    }

    /// Diffuse un événement d'abonnement.
    pub fn emit(&self, facility: EventFacility, kind: EventKind, index: u32) {
        let event = ChangeEvent {
            facility,
            kind,
            index,
        };
        debug!("event: {facility:?}/{kind:?} #{index}");
        self.hooks.events.fire(&event);
    }

    // ---- sinks ------------------------------------------------------

    pub(crate) fn register_sink(&self, sink: &Arc<Sink>) -> u32 {
        self.state.lock().sinks.insert(sink.clone())
    }

    pub(crate) fn unregister_sink(&self, index: u32) {
        self.state.lock().sinks.remove(index);
    }

    pub fn sink_by_index(&self, index: u32) -> Option<Arc<Sink>> {
        self.state.lock().sinks.get(index).cloned()
    }

    pub fn sink_by_name(&self, name: &str) -> Option<Arc<Sink>> {
        self.state
            .lock()
            .sinks
            .values()
            .find(|s| s.name == name)
            .cloned()
    }

    pub fn sinks(&self) -> Vec<Arc<Sink>> {
        self.state.lock().sinks.values().cloned().collect()
    }

    /// Le sink par défaut : celui configuré, sinon le premier.
    pub fn default_sink(&self) -> Option<Arc<Sink>> {
        let state = self.state.lock();
        if let Some(name) = &state.default_sink {
            if let Some(s) = state.sinks.values().find(|s| &s.name == name) {
                return Some(s.clone());
            }
        }
        state.sinks.first().map(|(_, s)| s.clone())
    }

    pub fn set_default_sink(&self, name: Option<String>) {
        self.state.lock().default_sink = name;
        self.emit(EventFacility::Server, EventKind::Change, 0);
    }

    // ---- sources ----------------------------------------------------

    pub(crate) fn register_source(&self, source: &Arc<Source>) -> u32 {
        self.state.lock().sources.insert(source.clone())
    }

    pub(crate) fn unregister_source(&self, index: u32) {
        self.state.lock().sources.remove(index);
    }

    pub fn source_by_index(&self, index: u32) -> Option<Arc<Source>> {
        self.state.lock().sources.get(index).cloned()
    }

    pub fn source_by_name(&self, name: &str) -> Option<Arc<Source>> {
        self.state
            .lock()
            .sources
            .values()
            .find(|s| s.name == name)
            .cloned()
    }

    pub fn sources(&self) -> Vec<Arc<Source>> {
        self.state.lock().sources.values().cloned().collect()
    }

    /// La source par défaut : celle configurée, sinon la première
    /// non-monitor, sinon la première.
    pub fn default_source(&self) -> Option<Arc<Source>> {
        let state = self.state.lock();
        if let Some(name) = &state.default_source {
            if let Some(s) = state.sources.values().find(|s| &s.name == name) {
                return Some(s.clone());
            }
        }
        let result = state
            .sources
            .values()
            .find(|s| !s.is_monitor())
            .cloned()
            .or_else(|| state.sources.first().map(|(_, s)| s.clone()));
        result
    }

    pub fn set_default_source(&self, name: Option<String>) {
        self.state.lock().default_source = name;
        self.emit(EventFacility::Server, EventKind::Change, 0);
    }

    // ---- flux -------------------------------------------------------

    pub(crate) fn register_sink_input(&self, input: &Arc<SinkInput>) -> u32 {
        self.state.lock().sink_inputs.insert(input.clone())
    }

    pub(crate) fn unregister_sink_input(&self, index: u32) {
        self.state.lock().sink_inputs.remove(index);
    }

    pub fn sink_input_by_index(&self, index: u32) -> Option<Arc<SinkInput>> {
        self.state.lock().sink_inputs.get(index).cloned()
    }

    pub fn sink_inputs(&self) -> Vec<Arc<SinkInput>> {
        self.state.lock().sink_inputs.values().cloned().collect()
    }

    pub(crate) fn register_source_output(&self, output: &Arc<SourceOutput>) -> u32 {
        self.state.lock().source_outputs.insert(output.clone())
    }

    pub(crate) fn unregister_source_output(&self, index: u32) {
        self.state.lock().source_outputs.remove(index);
    }

    pub fn source_output_by_index(&self, index: u32) -> Option<Arc<SourceOutput>> {
        self.state.lock().source_outputs.get(index).cloned()
    }

    pub fn source_outputs(&self) -> Vec<Arc<SourceOutput>> {
        self.state.lock().source_outputs.values().cloned().collect()
    }

    // ---- clients, cartes, modules -----------------------------------

    pub(crate) fn register_client(&self, client: &Arc<Client>) -> u32 {
        self.state.lock().clients.insert(client.clone())
    }

    pub(crate) fn unregister_client(&self, index: u32) {
        self.state.lock().clients.remove(index);
    }

    pub fn client_by_index(&self, index: u32) -> Option<Arc<Client>> {
        self.state.lock().clients.get(index).cloned()
    }

    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.state.lock().clients.values().cloned().collect()
    }

    pub(crate) fn register_card(&self, card: &Arc<Card>) -> u32 {
        self.state.lock().cards.insert(card.clone())
    }

    pub(crate) fn unregister_card(&self, index: u32) {
        self.state.lock().cards.remove(index);
    }

    pub fn card_by_index(&self, index: u32) -> Option<Arc<Card>> {
        self.state.lock().cards.get(index).cloned()
    }

    pub(crate) fn register_module(&self, module: &Arc<Module>) -> u32 {
        self.state.lock().modules.insert(module.clone())
    }

    pub(crate) fn unregister_module(&self, index: u32) {
        self.state.lock().modules.remove(index);
    }

    pub fn module_by_index(&self, index: u32) -> Option<Arc<Module>> {
        self.state.lock().modules.get(index).cloned()
    }

    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.state.lock().modules.values().cloned().collect()
    }

    /// Arrêt ordonné : unlink de tout, dans l'ordre inverse des
    /// dépendances.
    pub async fn shutdown(self: &Arc<Self>) {
        let inputs = self.sink_inputs();
        for i in inputs {
            i.unlink().await;
        }
        let outputs = self.source_outputs();
        for o in outputs {
            o.unlink().await;
        }
        let sinks = self.sinks();
        for s in sinks {
            s.unlink().await;
        }
        let sources = self.sources();
        for s in sources {
            s.unlink().await;
        }
        let modules = self.modules();
        for m in modules {
            m.unload();
        }
        debug!("core: shutdown complete");
    }
}

//! # sabmix - Cœur de routage et de mixage
//!
//! Le graphe d'objets du serveur : [`Core`] possède les sinks, sources,
//! flux clients (sink-inputs, source-outputs), clients, cartes et
//! modules, indexés par u32. Chaque sink (et source autonome) a son
//! thread IO dédié qui exécute la boucle de rendu ; le plan de contrôle
//! ne touche jamais l'état du thread IO autrement que par la file de
//! messages.
//!
//! Cycle de vie commun : `new` (enregistre dans le Core, hook NEW),
//! `put` (démarre le thread IO, hook PUT, INIT → IDLE/RUNNING),
//! `unlink` (idempotent, hooks UNLINK, tue les dépendants), puis chute
//! de la dernière référence.

pub mod card;
pub mod client;
pub mod converter;
pub mod core;
pub mod error;
pub mod hook;
pub mod mix;
pub mod module;
pub mod null;
pub mod sample_util;
pub mod sink;
pub mod sink_input;
pub mod source;
pub mod source_output;
pub mod types;
pub mod worker;

pub use crate::core::{ChangeEvent, Core, EventFacility, EventKind};
pub use card::{Card, CardProfile};
pub use client::Client;
pub use converter::Converter;
pub use error::MixError;
pub use hook::{Hook, HookSlot};
pub use module::Module;
pub use null::{NullSinkBackend, NullSourceBackend};
pub use sink::{Sink, SinkBackend, SinkEvent, SinkNewData};
pub use sink_input::{InputEvent, SinkInput, SinkInputNewData};
pub use source::{Source, SourceBackend, SourceNewData};
pub use source_output::{OutputEvent, SourceOutput, SourceOutputNewData};
pub use types::{
    DeviceFlags, DeviceState, LatencySpec, StreamState, SuspendCause, ABSOLUTE_MAX_LATENCY,
    ABSOLUTE_MIN_LATENCY, DEFAULT_FIXED_LATENCY,
};
pub use worker::{InputRender, OutputRender, SinkMsg, SinkWorker, SourceMsg, SourceWorker};

//! # sabcore - Types fondamentaux du serveur audio Sabine
//!
//! Cette crate fournit les briques de base partagées par tout le
//! serveur :
//!
//! - **Blocs mémoire** : buffers audio partagés et comptés par référence
//!   ([`MemBlock`]), vues ([`MemChunk`]) et files ([`MemBlockQ`]),
//!   alloués depuis un pool à taille de slab fixe ([`MemPool`])
//! - **Conteneurs indexés** : [`DynArray`] (indices avec trous) et
//!   [`IdxSet`] (indices u32 monotones, stables pour la durée de vie
//!   de l'objet)
//! - **Formats audio** : [`SampleSpec`], [`ChannelMap`], [`CVolume`]
//! - **Métadonnées** : [`Proplist`]
//!
//! Aucune dépendance sur le runtime async : tout est synchrone et
//! partageable entre threads.

pub mod channelmap;
pub mod dynarray;
pub mod error;
pub mod idxset;
pub mod memblock;
pub mod memblockq;
pub mod memchunk;
pub mod proplist;
pub mod sample;
pub mod volume;

pub use channelmap::{ChannelMap, ChannelPosition};
pub use dynarray::DynArray;
pub use error::CoreError;
pub use idxset::IdxSet;
pub use memblock::{BlockRef, MemBlock, MemPool, PoolStats};
pub use memblockq::{MemBlockQ, SeekMode};
pub use memchunk::MemChunk;
pub use proplist::{Proplist, UpdateMode};
pub use sample::{SampleFormat, SampleSpec};
pub use volume::{CVolume, Volume};

/// Index invalide, utilisé par les conteneurs et le protocole.
pub const INVALID_INDEX: u32 = u32::MAX;

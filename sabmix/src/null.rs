//! Pilotes nuls : sink qui jette l'audio rendu, source qui produit du
//! silence. Périphériques par défaut des tests et des configurations
//! sans matériel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sabcore::{MemChunk, MemPool, SampleSpec};

use crate::error::MixError;
use crate::sink::SinkBackend;
use crate::source::SourceBackend;

/// Sink nul : consomme les périodes rendues en comptant les octets.
pub struct NullSinkBackend {
    written: Arc<AtomicU64>,
}

impl NullSinkBackend {
    pub fn new() -> Self {
        NullSinkBackend {
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Compteur partagé d'octets consommés, pour les tests.
    pub fn written_counter(&self) -> Arc<AtomicU64> {
        self.written.clone()
    }
}

impl Default for NullSinkBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SinkBackend for NullSinkBackend {
    async fn write(&mut self, chunk: &MemChunk) -> Result<(), MixError> {
        self.written
            .fetch_add(chunk.length as u64, Ordering::Relaxed);
        Ok(())
    }

    fn latency(&self) -> Duration {
        Duration::ZERO
    }
}

/// Source nulle : produit du silence au rythme demandé.
pub struct NullSourceBackend {
    spec: SampleSpec,
}

impl NullSourceBackend {
    pub fn new(spec: SampleSpec) -> Self {
        NullSourceBackend { spec }
    }
}

#[async_trait::async_trait]
impl SourceBackend for NullSourceBackend {
    async fn read(&mut self, period: Duration, pool: &MemPool) -> Result<MemChunk, MixError> {
        let bytes = self
            .spec
            .align_down(self.spec.duration_to_bytes(period))
            .max(self.spec.frame_size());
        let mut chunk = MemChunk::new(pool.silence_block(&self.spec));
        chunk.truncate(bytes);
        Ok(chunk)
    }
}

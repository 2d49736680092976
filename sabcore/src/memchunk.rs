//! Vue `(bloc, index, longueur)` sur un [`MemBlock`].

use crate::error::CoreError;
use crate::memblock::{BlockRef, MemBlock, MemPool};
use crate::sample::SampleSpec;

/// Vue sur une tranche d'un bloc mémoire.
///
/// Invariant : `index + length <= block.len()`. Une vue vide
/// (`length == 0`) reste valide et garde une référence sur son bloc.
#[derive(Clone)]
pub struct MemChunk {
    pub block: MemBlock,
    pub index: usize,
    pub length: usize,
}

impl MemChunk {
    /// Vue couvrant tout le bloc.
    pub fn new(block: MemBlock) -> Self {
        let length = block.len();
        MemChunk {
            block,
            index: 0,
            length,
        }
    }

    /// Vue sur `[index, index + length)`.
    pub fn with_range(block: MemBlock, index: usize, length: usize) -> Result<Self, CoreError> {
        if index
            .checked_add(length)
            .map(|end| end > block.len())
            .unwrap_or(true)
        {
            return Err(CoreError::InvalidArg(format!(
                "range {}+{} out of block of {} bytes",
                index,
                length,
                block.len()
            )));
        }
        Ok(MemChunk {
            block,
            index,
            length,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.index
            .checked_add(self.length)
            .map(|end| end <= self.block.len())
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Vrai si la vue couvre un bloc de silence (ou est vide).
    pub fn is_silence(&self) -> bool {
        self.length == 0 || self.block.is_silence()
    }

    /// Vide la vue : longueur nulle, le bloc est conservé.
    pub fn reset(&mut self) {
        self.index = 0;
        self.length = 0;
    }

    /// Lecture épinglée des octets couverts.
    pub fn bytes(&self) -> ChunkRef<'_> {
        ChunkRef {
            guard: self.block.acquire(),
            index: self.index,
            length: self.length,
        }
    }

    /// Écriture directe, disponible après [`MemChunk::make_writable`].
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        let index = self.index;
        let length = self.length;
        self.block
            .try_mut()
            .map(|data| &mut data[index..index + length])
    }

    /// Garantit un bloc exclusif et mutable d'au moins `min_length`
    /// octets utiles, en préservant le contenu couvert par la vue.
    ///
    /// Si le bloc est déjà exclusif, mutable et assez grand, ne fait
    /// rien. Sinon un nouveau bloc est demandé au pool (ou hors pool si
    /// la taille dépasse le slab), le contenu est copié et la vue
    /// rebasée à l'index 0.
    pub fn make_writable(&mut self, pool: &MemPool, min_length: usize) -> Result<(), CoreError> {
        let needed = self.length.max(min_length);
        if self.block.is_unique()
            && !self.block.is_read_only()
            && !self.block.is_silence()
            && self.index + needed <= self.block.len()
        {
            return Ok(());
        }
        let mut fresh = if needed <= pool.block_size_max() {
            match pool.alloc(needed) {
                Ok(b) => b,
                Err(CoreError::PoolExhausted) => pool.alloc_appended(needed),
                Err(e) => return Err(e),
            }
        } else {
            pool.alloc_appended(needed)
        };
        {
            let src = self.bytes();
            let dst = fresh.try_mut().ok_or(CoreError::ReadOnly)?;
            dst[..src.len()].copy_from_slice(&src);
        }
        self.block = fresh;
        self.index = 0;
        Ok(())
    }

    /// Assure la possession exclusive du contenu couvert, sans
    /// l'agrandir.
    pub fn isolate(&mut self, pool: &MemPool) -> Result<(), CoreError> {
        self.make_writable(pool, self.length)
    }

    /// Copie `src` au début de `dst`. `dst.length >= src.length` exigé.
    pub fn copy(dst: &mut MemChunk, src: &MemChunk, pool: &MemPool) -> Result<(), CoreError> {
        if dst.length < src.length {
            return Err(CoreError::InvalidArg(format!(
                "destination {} bytes, source {}",
                dst.length, src.length
            )));
        }
        dst.make_writable(pool, dst.length)?;
        let data = src.bytes().to_vec();
        let out = dst.bytes_mut().ok_or(CoreError::ReadOnly)?;
        out[..data.len()].copy_from_slice(&data);
        Ok(())
    }

    /// Remplit la vue avec le silence du format de `spec`.
    pub fn silence(&mut self, spec: &SampleSpec, pool: &MemPool) -> Result<(), CoreError> {
        self.make_writable(pool, self.length)?;
        let byte = spec.format.silence_byte();
        if let Some(data) = self.bytes_mut() {
            data.fill(byte);
        }
        Ok(())
    }

    /// Avance la vue de `bytes` octets (consommation en tête).
    pub fn advance(&mut self, bytes: usize) {
        let n = bytes.min(self.length);
        self.index += n;
        self.length -= n;
    }

    /// Tronque la vue à `bytes` octets.
    pub fn truncate(&mut self, bytes: usize) {
        self.length = self.length.min(bytes);
    }
}

impl std::fmt::Debug for MemChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemChunk")
            .field("index", &self.index)
            .field("length", &self.length)
            .field("block_len", &self.block.len())
            .finish()
    }
}

/// Guard de lecture des octets d'une vue.
pub struct ChunkRef<'a> {
    guard: BlockRef<'a>,
    index: usize,
    length: usize,
}

impl std::ops::Deref for ChunkRef<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard[self.index..self.index + self.length]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> MemPool {
        MemPool::new(1024, 16)
    }

    fn chunk_with(pool: &MemPool, data: &[u8]) -> MemChunk {
        let mut b = pool.alloc(data.len()).unwrap();
        b.try_mut().unwrap().copy_from_slice(data);
        MemChunk::new(b)
    }

    #[test]
    fn range_invariant() {
        let p = pool();
        let b = p.alloc(10).unwrap();
        assert!(MemChunk::with_range(b.clone(), 4, 6).is_ok());
        assert!(MemChunk::with_range(b.clone(), 4, 7).is_err());
        assert!(MemChunk::with_range(b, usize::MAX, 2).is_err());
    }

    #[test]
    fn make_writable_clones_shared_blocks() {
        let p = pool();
        let mut c = chunk_with(&p, &[1, 2, 3, 4]);
        let shared = c.block.clone();
        c.make_writable(&p, 4).unwrap();
        assert!(!c.block.same_block(&shared));
        assert_eq!(&*c.bytes(), &[1, 2, 3, 4]);
        c.bytes_mut().unwrap()[0] = 9;
        // L'original n'est pas touché.
        assert_eq!(&*MemChunk::new(shared).bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn make_writable_noop_when_exclusive() {
        let p = pool();
        let mut c = chunk_with(&p, &[5, 6, 7]);
        let before = c.block.clone();
        drop(before);
        c.make_writable(&p, 3).unwrap();
        assert_eq!(&*c.bytes(), &[5, 6, 7]);
    }

    #[test]
    fn copy_requires_capacity() {
        let p = pool();
        let src = chunk_with(&p, &[1, 2, 3, 4]);
        let mut small = chunk_with(&p, &[0, 0]);
        assert!(MemChunk::copy(&mut small, &src, &p).is_err());
        let mut dst = chunk_with(&p, &[0; 6]);
        MemChunk::copy(&mut dst, &src, &p).unwrap();
        assert_eq!(&dst.bytes()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn advance_and_truncate() {
        let p = pool();
        let mut c = chunk_with(&p, &[1, 2, 3, 4, 5]);
        c.advance(2);
        assert_eq!(&*c.bytes(), &[3, 4, 5]);
        c.truncate(1);
        assert_eq!(&*c.bytes(), &[3]);
        c.advance(10);
        assert!(c.is_empty());
    }
}

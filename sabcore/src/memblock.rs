//! Blocs mémoire partagés et pool d'allocation.
//!
//! Un [`MemBlock`] est un buffer audio compté par référence : le clonage
//! ne copie jamais les données. Les données sont immuables dès que le
//! bloc est partagé ; l'écriture passe par [`MemBlock::try_mut`]
//! (possesseur unique) ou par [`MemChunk::make_writable`](crate::MemChunk::make_writable)
//! qui duplique au besoin.
//!
//! Le [`MemPool`] alloue des slabs de taille fixe et tient des
//! statistiques atomiques par type de bloc, courantes et cumulées.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::CoreError;
use crate::sample::SampleSpec;

/// Taille de slab par défaut (64 KiB).
pub const DEFAULT_SLAB_SIZE: usize = 64 * 1024;

/// Nombre de slabs résidents par défaut.
pub const DEFAULT_POOL_SLABS: usize = 1024;

/// Type d'un bloc, pour les statistiques.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum BlockKind {
    /// Slab issu du pool, restitué au pool à la destruction.
    Pool = 0,
    /// Allocation ponctuelle sur le tas, hors pool.
    Appended = 1,
    /// Buffer fourni par l'appelant, libéré via son callback.
    User = 2,
    /// Région fixe en lecture seule (données statiques).
    Fixed = 3,
    /// Bloc importé d'un pair, en lecture seule.
    Imported = 4,
}

const KIND_COUNT: usize = 5;

/// Statistiques d'un pool. Tous les compteurs sont atomiques.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Blocs vivants, par type.
    pub n_allocated: [AtomicU64; KIND_COUNT],
    /// Octets vivants, par type.
    pub allocated_size: [AtomicU64; KIND_COUNT],
    /// Blocs créés depuis le début, par type.
    pub n_accumulated: [AtomicU64; KIND_COUNT],
    /// Octets créés depuis le début, par type.
    pub accumulated_size: [AtomicU64; KIND_COUNT],
}

impl PoolStats {
    fn on_new(&self, kind: BlockKind, len: usize) {
        let k = kind as usize;
        self.n_allocated[k].fetch_add(1, Ordering::Relaxed);
        self.allocated_size[k].fetch_add(len as u64, Ordering::Relaxed);
        self.n_accumulated[k].fetch_add(1, Ordering::Relaxed);
        self.accumulated_size[k].fetch_add(len as u64, Ordering::Relaxed);
    }

    fn on_drop(&self, kind: BlockKind, len: usize) {
        let k = kind as usize;
        self.n_allocated[k].fetch_sub(1, Ordering::Relaxed);
        self.allocated_size[k].fetch_sub(len as u64, Ordering::Relaxed);
    }

    /// Total de blocs vivants, tous types confondus.
    pub fn total_allocated(&self) -> u64 {
        self.n_allocated
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Total d'octets vivants, tous types confondus.
    pub fn total_size(&self) -> u64 {
        self.allocated_size
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Total cumulé de blocs depuis la création du pool.
    pub fn total_accumulated(&self) -> u64 {
        self.n_accumulated
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Total cumulé d'octets depuis la création du pool.
    pub fn total_accumulated_size(&self) -> u64 {
        self.accumulated_size
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

struct PoolInner {
    slab_size: usize,
    block_size_max: usize,
    max_slabs: usize,
    free_slabs: Mutex<Vec<Box<[u8]>>>,
    outstanding_slabs: AtomicUsize,
    stats: PoolStats,
    silence: Mutex<Vec<(u8, MemBlock)>>,
}

/// Pool d'allocation de blocs audio.
///
/// Clonable : toutes les copies partagent le même pool.
///
/// # Exemples
///
/// ```
/// use sabcore::MemPool;
///
/// let pool = MemPool::new(64 * 1024, 16);
/// let block = pool.alloc(1024).unwrap();
/// let shared = block.clone();
///
/// // Le clonage partage le buffer sans copier.
/// assert!(!shared.is_unique());
/// assert_eq!(pool.stats().total_allocated(), 1);
/// ```
#[derive(Clone)]
pub struct MemPool {
    inner: Arc<PoolInner>,
}

impl MemPool {
    pub fn new(slab_size: usize, max_slabs: usize) -> Self {
        MemPool {
            inner: Arc::new(PoolInner {
                slab_size,
                block_size_max: slab_size,
                max_slabs,
                free_slabs: Mutex::new(Vec::new()),
                outstanding_slabs: AtomicUsize::new(0),
                stats: PoolStats::default(),
                silence: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Taille maximale qu'un appelant peut demander à [`MemPool::alloc`].
    pub fn block_size_max(&self) -> usize {
        self.inner.block_size_max
    }

    pub fn slab_size(&self) -> usize {
        self.inner.slab_size
    }

    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }

    /// Alloue un bloc de `len` octets depuis le pool.
    ///
    /// # Erreurs
    ///
    /// - [`CoreError::TooLarge`] si `len` dépasse [`MemPool::block_size_max`]
    /// - [`CoreError::PoolExhausted`] si tous les slabs sont en circulation
    pub fn alloc(&self, len: usize) -> Result<MemBlock, CoreError> {
        if len > self.inner.block_size_max {
            return Err(CoreError::TooLarge {
                requested: len,
                max: self.inner.block_size_max,
            });
        }
        let slab = {
            let mut free = self.inner.free_slabs.lock();
            match free.pop() {
                Some(s) => s,
                None => {
                    if self.inner.outstanding_slabs.load(Ordering::Relaxed)
                        >= self.inner.max_slabs
                    {
                        return Err(CoreError::PoolExhausted);
                    }
                    vec![0u8; self.inner.slab_size].into_boxed_slice()
                }
            }
        };
        self.inner.outstanding_slabs.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.on_new(BlockKind::Pool, len);
        Ok(MemBlock {
            inner: Arc::new(BlockInner {
                storage: Storage::Owned(slab),
                length: len,
                kind: BlockKind::Pool,
                read_only: false,
                silence: AtomicBool::new(false),
                acquired: AtomicUsize::new(0),
                pool: Arc::downgrade(&self.inner),
                on_free: Mutex::new(None),
            }),
        })
    }

    /// Alloue un bloc hors pool, sans limite de taille de slab.
    pub fn alloc_appended(&self, len: usize) -> MemBlock {
        self.inner.stats.on_new(BlockKind::Appended, len);
        MemBlock {
            inner: Arc::new(BlockInner {
                storage: Storage::Owned(vec![0u8; len].into_boxed_slice()),
                length: len,
                kind: BlockKind::Appended,
                read_only: false,
                silence: AtomicBool::new(false),
                acquired: AtomicUsize::new(0),
                pool: Arc::downgrade(&self.inner),
                on_free: Mutex::new(None),
            }),
        }
    }

    /// Adopte un buffer fourni par l'appelant.
    ///
    /// `on_free`, s'il est fourni, est appelé à la destruction du bloc.
    pub fn new_user(
        &self,
        data: Vec<u8>,
        on_free: Option<Box<dyn FnOnce() + Send>>,
    ) -> MemBlock {
        let len = data.len();
        self.inner.stats.on_new(BlockKind::User, len);
        MemBlock {
            inner: Arc::new(BlockInner {
                storage: Storage::Owned(data.into_boxed_slice()),
                length: len,
                kind: BlockKind::User,
                read_only: false,
                silence: AtomicBool::new(false),
                acquired: AtomicUsize::new(0),
                pool: Arc::downgrade(&self.inner),
                on_free: Mutex::new(on_free),
            }),
        }
    }

    /// Adopte un bloc importé d'un pair.
    ///
    /// Un bloc importé est en lecture seule : le contenu appartient
    /// logiquement au pair, toute écriture passe par
    /// [`MemChunk::make_writable`](crate::MemChunk::make_writable) qui
    /// duplique dans un bloc local.
    ///
    /// # Exemples
    ///
    /// ```
    /// use sabcore::memblock::{BlockKind, MemPool};
    ///
    /// let pool = MemPool::new(1024, 4);
    /// let mut block = pool.new_imported(vec![7u8; 16]);
    /// assert_eq!(block.kind(), BlockKind::Imported);
    /// assert!(block.is_read_only());
    /// assert!(block.try_mut().is_none());
    /// ```
    pub fn new_imported(&self, data: Vec<u8>) -> MemBlock {
        let len = data.len();
        self.inner.stats.on_new(BlockKind::Imported, len);
        MemBlock {
            inner: Arc::new(BlockInner {
                storage: Storage::Owned(data.into_boxed_slice()),
                length: len,
                kind: BlockKind::Imported,
                read_only: true,
                silence: AtomicBool::new(false),
                acquired: AtomicUsize::new(0),
                pool: Arc::downgrade(&self.inner),
                on_free: Mutex::new(None),
            }),
        }
    }

    /// Référence une région statique en lecture seule.
    pub fn new_fixed(&self, data: &'static [u8]) -> MemBlock {
        self.inner.stats.on_new(BlockKind::Fixed, data.len());
        MemBlock {
            inner: Arc::new(BlockInner {
                storage: Storage::Fixed(data),
                length: data.len(),
                kind: BlockKind::Fixed,
                read_only: true,
                silence: AtomicBool::new(false),
                acquired: AtomicUsize::new(0),
                pool: Arc::downgrade(&self.inner),
                on_free: Mutex::new(None),
            }),
        }
    }

    /// Bloc de silence pour `spec`, long d'un slab entier (aligné frame).
    ///
    /// Le bloc est mis en cache par octet de silence : les lectures sur
    /// un trou ou sur un objet suspendu partagent toutes la même
    /// référence, sans copie.
    pub fn silence_block(&self, spec: &SampleSpec) -> MemBlock {
        let byte = spec.format.silence_byte();
        {
            let cache = self.inner.silence.lock();
            if let Some((_, block)) = cache.iter().find(|(b, _)| *b == byte) {
                return block.clone();
            }
        }
        let len = spec.align_down(self.inner.slab_size).max(spec.frame_size());
        let mut block = self
            .alloc(len)
            .unwrap_or_else(|_| self.alloc_appended(len));
        // Possesseur unique à ce point : un slab recyclé garde ses
        // anciennes données, il faut le remplir.
        if let Some(data) = block.try_mut() {
            data.fill(byte);
        }
        block.inner.silence.store(true, Ordering::Release);
        self.inner.silence.lock().push((byte, block.clone()));
        block
    }
}

impl std::fmt::Debug for MemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPool")
            .field("slab_size", &self.inner.slab_size)
            .field("max_slabs", &self.inner.max_slabs)
            .field("allocated", &self.inner.stats.total_allocated())
            .finish()
    }
}

enum Storage {
    Owned(Box<[u8]>),
    Fixed(&'static [u8]),
}

struct BlockInner {
    storage: Storage,
    length: usize,
    kind: BlockKind,
    read_only: bool,
    silence: AtomicBool,
    acquired: AtomicUsize,
    pool: Weak<PoolInner>,
    on_free: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        if let Some(cb) = self.on_free.lock().take() {
            cb();
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.stats.on_drop(self.kind, self.length);
            if self.kind == BlockKind::Pool {
                pool.outstanding_slabs.fetch_sub(1, Ordering::Relaxed);
                if let Storage::Owned(slab) = std::mem::replace(
                    &mut self.storage,
                    Storage::Fixed(&[]),
                ) {
                    let mut free = pool.free_slabs.lock();
                    if free.len() + pool.outstanding_slabs.load(Ordering::Relaxed)
                        < pool.max_slabs
                    {
                        free.push(slab);
                    }
                }
            }
        }
    }
}

/// Bloc mémoire audio partagé.
///
/// `Clone` incrémente le compteur de références ; le bloc est détruit
/// (et son slab restitué au pool) quand la dernière référence tombe.
#[derive(Clone)]
pub struct MemBlock {
    inner: Arc<BlockInner>,
}

impl MemBlock {
    /// Longueur utile du bloc en octets.
    pub fn len(&self) -> usize {
        self.inner.length
    }

    pub fn is_empty(&self) -> bool {
        self.inner.length == 0
    }

    pub fn kind(&self) -> BlockKind {
        self.inner.kind
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// Vrai si le bloc est marqué comme silence pur.
    pub fn is_silence(&self) -> bool {
        self.inner.silence.load(Ordering::Acquire)
    }

    /// Vrai si ce `MemBlock` est l'unique référence au buffer.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Vrai si deux références désignent le même bloc.
    pub fn same_block(&self, other: &MemBlock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Épingle les données en lecture. Le guard rend la main à sa chute.
    pub fn acquire(&self) -> BlockRef<'_> {
        self.inner.acquired.fetch_add(1, Ordering::AcqRel);
        BlockRef { block: self }
    }

    /// Nombre de guards [`BlockRef`] actifs.
    pub fn acquired_count(&self) -> usize {
        self.inner.acquired.load(Ordering::Acquire)
    }

    /// Accès exclusif en écriture.
    ///
    /// Disponible seulement si le bloc n'est pas partagé et n'est pas en
    /// lecture seule ; sinon `None` et l'appelant doit passer par
    /// [`MemChunk::make_writable`](crate::MemChunk::make_writable).
    /// Écrire invalide le marqueur de silence.
    ///
    /// # Exemples
    ///
    /// ```
    /// use sabcore::MemPool;
    ///
    /// let pool = MemPool::new(1024, 4);
    /// let mut block = pool.alloc(4).unwrap();
    /// block.try_mut().unwrap().copy_from_slice(&[1, 2, 3, 4]);
    ///
    /// // Partagé : plus d'écriture directe possible.
    /// let shared = block.clone();
    /// assert!(block.try_mut().is_none());
    /// drop(shared);
    /// assert_eq!(&*block.acquire(), &[1, 2, 3, 4]);
    /// ```
    pub fn try_mut(&mut self) -> Option<&mut [u8]> {
        let inner = Arc::get_mut(&mut self.inner)?;
        if inner.read_only {
            return None;
        }
        inner.silence.store(false, Ordering::Release);
        let len = inner.length;
        match &mut inner.storage {
            Storage::Owned(data) => Some(&mut data[..len]),
            Storage::Fixed(_) => None,
        }
    }

    fn data(&self) -> &[u8] {
        match &self.inner.storage {
            Storage::Owned(data) => &data[..self.inner.length],
            Storage::Fixed(data) => data,
        }
    }
}

impl std::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("len", &self.inner.length)
            .field("kind", &self.inner.kind)
            .field("refs", &Arc::strong_count(&self.inner))
            .finish()
    }
}

/// Guard de lecture d'un [`MemBlock`].
pub struct BlockRef<'a> {
    block: &'a MemBlock,
}

impl std::ops::Deref for BlockRef<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.block.data()
    }
}

impl Drop for BlockRef<'_> {
    fn drop(&mut self) {
        self.block.inner.acquired.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleFormat;

    fn pool() -> MemPool {
        MemPool::new(1024, 4)
    }

    #[test]
    fn alloc_and_reclaim() {
        let p = pool();
        let b = p.alloc(512).unwrap();
        assert_eq!(b.len(), 512);
        assert_eq!(p.stats().total_allocated(), 1);
        drop(b);
        assert_eq!(p.stats().total_allocated(), 0);
        assert_eq!(p.stats().total_accumulated(), 1);
    }

    #[test]
    fn too_large_and_exhausted() {
        let p = pool();
        assert!(matches!(
            p.alloc(2048),
            Err(CoreError::TooLarge { .. })
        ));
        let blocks: Vec<_> = (0..4).map(|_| p.alloc(10).unwrap()).collect();
        assert!(matches!(p.alloc(10), Err(CoreError::PoolExhausted)));
        drop(blocks);
        assert!(p.alloc(10).is_ok());
    }

    #[test]
    fn acquire_release_pairs() {
        let p = pool();
        let b = p.alloc(16).unwrap();
        {
            let r1 = b.acquire();
            let r2 = b.acquire();
            assert_eq!(b.acquired_count(), 2);
            assert_eq!(r1.len(), 16);
            assert_eq!(r2.len(), 16);
        }
        assert_eq!(b.acquired_count(), 0);
    }

    #[test]
    fn try_mut_requires_exclusive() {
        let p = pool();
        let mut b = p.alloc(16).unwrap();
        assert!(b.try_mut().is_some());
        let b2 = b.clone();
        assert!(b.try_mut().is_none());
        drop(b2);
        assert!(b.try_mut().is_some());
    }

    #[test]
    fn fixed_blocks_are_read_only() {
        static DATA: [u8; 4] = [1, 2, 3, 4];
        let p = pool();
        let mut b = p.new_fixed(&DATA);
        assert!(b.is_read_only());
        assert!(b.try_mut().is_none());
        assert_eq!(&*b.acquire(), &DATA);
    }

    #[test]
    fn imported_blocks_are_foreign_and_read_only() {
        let p = pool();
        let mut b = p.new_imported(vec![1, 2, 3]);
        assert_eq!(b.kind(), BlockKind::Imported);
        assert!(b.is_read_only());
        assert!(b.try_mut().is_none());
        assert_eq!(&*b.acquire(), &[1, 2, 3]);
        assert_eq!(
            p.stats().n_allocated[BlockKind::Imported as usize]
                .load(Ordering::Relaxed),
            1
        );
        drop(b);
        assert_eq!(
            p.stats().n_allocated[BlockKind::Imported as usize]
                .load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn user_free_callback_runs() {
        use std::sync::atomic::AtomicBool;
        static FREED: AtomicBool = AtomicBool::new(false);
        let p = pool();
        let b = p.new_user(
            vec![0u8; 8],
            Some(Box::new(|| FREED.store(true, Ordering::SeqCst))),
        );
        drop(b);
        assert!(FREED.load(Ordering::SeqCst));
    }

    #[test]
    fn silence_block_is_cached_and_marked() {
        let p = MemPool::new(1024, 4);
        let spec = SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap();
        let a = p.silence_block(&spec);
        let b = p.silence_block(&spec);
        assert!(a.same_block(&b));
        assert!(a.is_silence());
        assert!(a.acquire().iter().all(|x| *x == 0));
        let u8spec = SampleSpec::new(SampleFormat::U8, 1, 8000).unwrap();
        let c = p.silence_block(&u8spec);
        assert!(c.acquire().iter().all(|x| *x == 0x80));
    }
}

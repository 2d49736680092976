//! File ordonnée de vues mémoire avec index de lecture/écriture,
//! pré-buffer et silence implicite dans les trous.
//!
//! Les index sont des positions absolues en octets (i64) : l'index
//! d'écriture avance à chaque push, l'index de lecture à chaque drop.
//! Un `seek` déplace l'index d'écriture ; les octets jamais écrits
//! entre deux vues sont lus comme du silence.

use std::collections::VecDeque;

use crate::error::CoreError;
use crate::memchunk::MemChunk;

/// Mode de positionnement de l'index d'écriture.
///
/// Les valeurs numériques sont celles des frames du protocole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SeekMode {
    /// Décalage relatif à l'index d'écriture.
    Relative = 0,
    /// Position absolue.
    Absolute = 1,
    /// Décalage relatif à l'index de lecture.
    RelativeOnRead = 2,
    /// Identique à `Relative`, distinction historique du protocole.
    RelativeEnd = 3,
}

impl SeekMode {
    pub fn from_wire(v: u32) -> Option<Self> {
        Some(match v {
            0 => SeekMode::Relative,
            1 => SeekMode::Absolute,
            2 => SeekMode::RelativeOnRead,
            3 => SeekMode::RelativeEnd,
            _ => return None,
        })
    }
}

/// Paramètres de dimensionnement d'une file.
#[derive(Debug, Clone, Copy)]
pub struct BlockQAttr {
    /// Longueur maximale en octets.
    pub maxlength: usize,
    /// Longueur cible que l'écrivain doit maintenir.
    pub tlength: usize,
    /// Seuil de pré-buffer : la lecture ne démarre qu'une fois ce
    /// remplissage atteint.
    pub prebuf: usize,
    /// Quantum minimal de demande à l'écrivain.
    pub minreq: usize,
}

impl BlockQAttr {
    /// Borne les attributs à des valeurs cohérentes entre elles,
    /// alignées sur `base`.
    pub fn sanitize(mut self, base: usize) -> Self {
        let align = |v: usize| ((v + base - 1) / base) * base;
        if self.maxlength == 0 {
            self.maxlength = base;
        }
        self.maxlength = align(self.maxlength);
        self.tlength = align(self.tlength.min(self.maxlength)).max(base);
        if self.prebuf > self.tlength {
            self.prebuf = self.tlength;
        }
        if self.minreq == 0 {
            self.minreq = base;
        }
        self.minreq = align(self.minreq.min(self.tlength));
        self
    }
}

struct Item {
    index: i64,
    chunk: MemChunk,
}

impl Item {
    fn end(&self) -> i64 {
        self.index + self.chunk.length as i64
    }
}

/// File de vues mémoire.
///
/// # Exemples
///
/// ```
/// use sabcore::{
///     memblockq::BlockQAttr, MemBlockQ, MemChunk, MemPool, SampleFormat, SampleSpec,
/// };
///
/// let pool = MemPool::new(1024, 16);
/// let spec = SampleSpec::new(SampleFormat::U8, 1, 8000).unwrap();
/// let silence = MemChunk::new(pool.silence_block(&spec));
/// let mut q = MemBlockQ::new(
///     1,
///     BlockQAttr {
///         maxlength: 512,
///         tlength: 128,
///         prebuf: 0,
///         minreq: 16,
///     },
///     silence,
/// );
///
/// let mut block = pool.alloc(4).unwrap();
/// block.try_mut().unwrap().copy_from_slice(&[1, 2, 3, 4]);
/// q.push(MemChunk::new(block)).unwrap();
///
/// // peek puis drop de la même longueur : la file avance, sans copie.
/// let peeked = q.peek().unwrap();
/// assert_eq!(&*peeked.bytes(), &[1, 2, 3, 4]);
/// q.drop_bytes(peeked.length);
/// assert!(q.is_empty());
/// ```
pub struct MemBlockQ {
    items: VecDeque<Item>,
    read_index: i64,
    write_index: i64,
    base: usize,
    attr: BlockQAttr,
    silence: MemChunk,
    in_prebuf: bool,
    requested: i64,
}

impl MemBlockQ {
    /// `base` est la taille de frame ; `silence` la vue modèle rendue
    /// dans les trous et pendant les sous-alimentations.
    pub fn new(base: usize, attr: BlockQAttr, silence: MemChunk) -> Self {
        let attr = attr.sanitize(base.max(1));
        MemBlockQ {
            items: VecDeque::new(),
            read_index: 0,
            write_index: 0,
            base: base.max(1),
            attr,
            silence,
            in_prebuf: attr.prebuf > 0,
            requested: 0,
        }
    }

    pub fn attr(&self) -> BlockQAttr {
        self.attr
    }

    pub fn set_attr(&mut self, attr: BlockQAttr) {
        self.attr = attr.sanitize(self.base);
    }

    pub fn read_index(&self) -> i64 {
        self.read_index
    }

    pub fn write_index(&self) -> i64 {
        self.write_index
    }

    /// Octets entre lecture et écriture (0 si l'écriture est en retard).
    pub fn len(&self) -> usize {
        (self.write_index - self.read_index).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place `chunk` à l'index d'écriture courant et avance celui-ci.
    ///
    /// Les données déjà présentes sur l'intervalle sont écrasées (les
    /// vues existantes sont rognées ou coupées en deux).
    pub fn push(&mut self, chunk: MemChunk) -> Result<(), CoreError> {
        if chunk.length == 0 {
            return Ok(());
        }
        let start = self.write_index;
        let end = start + chunk.length as i64;
        if (end - self.read_index) as usize > self.attr.maxlength {
            return Err(CoreError::InvalidArg(format!(
                "push of {} bytes overflows maxlength {}",
                chunk.length, self.attr.maxlength
            )));
        }

        self.overwrite_range(start, end);

        // Insertion triée par index.
        let pos = self
            .items
            .iter()
            .position(|it| it.index > start)
            .unwrap_or(self.items.len());
        self.items.insert(
            pos,
            Item {
                index: start,
                chunk,
            },
        );
        self.write_index = end;
        self.requested = (self.requested - (end - start)).max(0);
        if self.in_prebuf && self.len() >= self.attr.prebuf {
            self.in_prebuf = false;
        }
        Ok(())
    }

    /// Rogne toute vue existante recouvrant `[start, end)`.
    fn overwrite_range(&mut self, start: i64, end: i64) {
        let mut split: Option<Item> = None;
        self.items.retain_mut(|it| {
            if it.end() <= start || it.index >= end {
                return true;
            }
            if it.index < start && it.end() > end {
                // La nouvelle vue tombe au milieu : on coupe en deux.
                let mut tail = it.chunk.clone();
                tail.advance((end - it.index) as usize);
                split = Some(Item {
                    index: end,
                    chunk: tail,
                });
                it.chunk.truncate((start - it.index) as usize);
                return true;
            }
            if it.index < start {
                it.chunk.truncate((start - it.index) as usize);
                return true;
            }
            if it.end() > end {
                let cut = (end - it.index) as usize;
                it.chunk.advance(cut);
                it.index = end;
                return true;
            }
            // Entièrement recouverte.
            false
        });
        if let Some(tail) = split {
            let pos = self
                .items
                .iter()
                .position(|it| it.index > tail.index)
                .unwrap_or(self.items.len());
            self.items.insert(pos, tail);
        }
    }

    /// Déplace l'index d'écriture.
    pub fn seek(&mut self, offset: i64, mode: SeekMode) {
        self.write_index = match mode {
            SeekMode::Relative | SeekMode::RelativeEnd => self.write_index + offset,
            SeekMode::Absolute => offset,
            SeekMode::RelativeOnRead => self.read_index + offset,
        };
    }

    /// Prochaine vue lisible, sans consommer.
    ///
    /// `None` si la file est vide ou si le pré-buffer n'est pas encore
    /// satisfait. Un trou devant l'index de lecture est rendu comme une
    /// vue sur le bloc de silence (référence partagée, pas de copie).
    pub fn peek(&mut self) -> Option<MemChunk> {
        if self.in_prebuf {
            if self.len() < self.attr.prebuf {
                return None;
            }
            self.in_prebuf = false;
        }
        if self.read_index >= self.write_index {
            return None;
        }
        // Purge des vues entièrement derrière l'index de lecture
        // (possibles après seek arrière puis réécriture).
        while let Some(front) = self.items.front() {
            if front.end() <= self.read_index {
                self.items.pop_front();
            } else {
                break;
            }
        }
        let readable = (self.write_index - self.read_index) as usize;
        match self.items.front() {
            Some(front) if front.index <= self.read_index => {
                let mut chunk = front.chunk.clone();
                chunk.advance((self.read_index - front.index) as usize);
                chunk.truncate(readable);
                Some(chunk)
            }
            other => {
                // Trou (données jamais écrites, ou libérées puis
                // relues après rewind) : silence jusqu'à la prochaine
                // vue ou l'index d'écriture.
                let gap_end = other
                    .map(|it| it.index.min(self.write_index))
                    .unwrap_or(self.write_index);
                let gap = (gap_end - self.read_index).max(0) as usize;
                let mut chunk = self.silence.clone();
                chunk.truncate(gap.max(self.base).min(readable.max(self.base)));
                Some(chunk)
            }
        }
    }

    /// Consomme `bytes` octets : avance l'index de lecture et libère
    /// les vues dépassées.
    pub fn drop_bytes(&mut self, bytes: usize) {
        self.read_index += bytes as i64;
        while let Some(front) = self.items.front() {
            if front.end() <= self.read_index {
                self.items.pop_front();
            } else {
                break;
            }
        }
    }

    /// Recule l'index de lecture de `bytes` octets. Les octets déjà
    /// libérés sont relus comme du silence.
    pub fn rewind(&mut self, bytes: usize) {
        self.read_index -= bytes as i64;
    }

    /// Octets que l'écrivain devrait fournir maintenant, compte tenu de
    /// ce qui a déjà été demandé. Retourne 0 sous le quantum `minreq`.
    pub fn pop_missing(&mut self) -> usize {
        let missing =
            self.attr.tlength as i64 - self.len() as i64 - self.requested;
        if missing < self.attr.minreq as i64 {
            return 0;
        }
        self.requested += missing;
        missing as usize
    }

    /// Réarme le pré-buffer (prochaine lecture différée jusqu'au seuil).
    pub fn prebuf_force(&mut self) {
        if self.attr.prebuf > 0 {
            self.in_prebuf = true;
        }
    }

    /// Désarme le pré-buffer.
    pub fn prebuf_disable(&mut self) {
        self.in_prebuf = false;
    }

    pub fn is_in_prebuf(&self) -> bool {
        self.in_prebuf
    }

    /// Vide la file côté écriture : les données non lues sont jetées et
    /// l'index d'écriture rejoint l'index de lecture.
    pub fn flush_write(&mut self) {
        self.items.clear();
        self.write_index = self.read_index;
        self.prebuf_force();
    }

    /// Vide la file côté lecture : l'index de lecture saute à l'index
    /// d'écriture.
    pub fn flush_read(&mut self) {
        self.items.clear();
        self.read_index = self.write_index;
    }
}

impl std::fmt::Debug for MemBlockQ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlockQ")
            .field("read_index", &self.read_index)
            .field("write_index", &self.write_index)
            .field("items", &self.items.len())
            .field("in_prebuf", &self.in_prebuf)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memblock::MemPool;
    use crate::sample::{SampleFormat, SampleSpec};

    fn setup(prebuf: usize) -> (MemPool, MemBlockQ) {
        let pool = MemPool::new(1024, 64);
        let spec = SampleSpec::new(SampleFormat::U8, 1, 8000).unwrap();
        let silence = MemChunk::new(pool.silence_block(&spec));
        let q = MemBlockQ::new(
            1,
            BlockQAttr {
                maxlength: 512,
                tlength: 128,
                prebuf,
                minreq: 16,
            },
            silence,
        );
        (pool, q)
    }

    fn chunk(pool: &MemPool, data: &[u8]) -> MemChunk {
        let mut b = pool.alloc(data.len()).unwrap();
        b.try_mut().unwrap().copy_from_slice(data);
        MemChunk::new(b)
    }

    #[test]
    fn push_peek_drop_is_identity() {
        let (pool, mut q) = setup(0);
        let c = chunk(&pool, &[1, 2, 3, 4]);
        q.push(c).unwrap();
        let peeked = q.peek().unwrap();
        assert_eq!(&*peeked.bytes(), &[1, 2, 3, 4]);
        let before = (q.read_index(), q.write_index());
        q.drop_bytes(peeked.length);
        assert_eq!(q.read_index(), before.0 + 4);
        assert_eq!(q.write_index(), before.1);
        assert!(q.peek().is_none());
    }

    #[test]
    fn prebuf_gates_reads() {
        let (pool, mut q) = setup(8);
        q.push(chunk(&pool, &[1; 4])).unwrap();
        assert!(q.peek().is_none(), "4 < prebuf 8");
        q.push(chunk(&pool, &[2; 4])).unwrap();
        assert!(q.peek().is_some());
        // Une fois parti, un drain ne réarme pas le pré-buffer.
        q.drop_bytes(8);
        q.push(chunk(&pool, &[3; 2])).unwrap();
        assert!(q.peek().is_some());
    }

    #[test]
    fn holes_read_as_silence() {
        let (pool, mut q) = setup(0);
        q.push(chunk(&pool, &[7; 4])).unwrap();
        q.seek(4, SeekMode::Relative);
        q.push(chunk(&pool, &[9; 4])).unwrap();
        q.drop_bytes(4);
        let hole = q.peek().unwrap();
        assert!(hole.is_silence());
        assert_eq!(hole.length, 4);
        q.drop_bytes(4);
        assert_eq!(&*q.peek().unwrap().bytes(), &[9; 4]);
    }

    #[test]
    fn absolute_seek_and_overwrite() {
        let (pool, mut q) = setup(0);
        q.push(chunk(&pool, &[1; 8])).unwrap();
        q.seek(2, SeekMode::Absolute);
        q.push(chunk(&pool, &[5; 4])).unwrap();
        // L'index d'écriture est un curseur : il suit la fin du push.
        assert_eq!(q.write_index(), 6);
        let first = q.peek().unwrap();
        assert_eq!(&*first.bytes(), &[1, 1]);
        q.drop_bytes(2);
        assert_eq!(&*q.peek().unwrap().bytes(), &[5; 4]);
        q.drop_bytes(4);
        // Les anciennes données au-delà du curseur sont masquées.
        assert!(q.peek().is_none());
    }

    #[test]
    fn maxlength_is_enforced() {
        let (pool, mut q) = setup(0);
        q.push(chunk(&pool, &[0; 512])).unwrap();
        assert!(q.push(chunk(&pool, &[0; 1])).is_err());
    }

    #[test]
    fn pop_missing_tracks_requests() {
        let (pool, mut q) = setup(0);
        assert_eq!(q.pop_missing(), 128);
        // Déjà demandé : rien de plus tant que rien n'arrive.
        assert_eq!(q.pop_missing(), 0);
        q.push(chunk(&pool, &[0; 32])).unwrap();
        // 32 octets arrivés et consommés par la demande en cours.
        q.drop_bytes(32);
        assert_eq!(q.pop_missing(), 32);
    }

    #[test]
    fn rewind_rereads_silence() {
        let (pool, mut q) = setup(0);
        q.push(chunk(&pool, &[3; 4])).unwrap();
        q.drop_bytes(4);
        q.rewind(4);
        // Les vues consommées ont été libérées : relecture en silence.
        let c = q.peek().unwrap();
        assert!(c.is_silence());
    }
}

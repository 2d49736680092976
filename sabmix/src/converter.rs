//! Convertisseur de flux : format, canaux et cadence.
//!
//! Chaque flux client peut arriver dans une spec différente de celle
//! de son périphérique ; le convertisseur fait le pont sur le thread
//! IO. Le chemin interne est f32 entrelacé : décodage, remap de
//! canaux par position, interpolation linéaire pour la cadence, puis
//! encodage dans la spec de sortie.

use sabcore::{ChannelMap, MemChunk, MemPool, SampleSpec};

use crate::error::MixError;
use crate::sample_util::{decode, encode};

pub struct Converter {
    from: SampleSpec,
    to: SampleSpec,
    remap: Vec<usize>,
    /// Position fractionnaire dans le flux d'entrée pour
    /// l'interpolation (en frames d'entrée).
    phase: f64,
    /// Dernière frame d'entrée vue, pour interpoler en bord de chunk.
    carry: Option<Vec<f32>>,
}

impl Converter {
    pub fn new(
        from: SampleSpec,
        from_map: &ChannelMap,
        to: SampleSpec,
        to_map: &ChannelMap,
    ) -> Result<Self, MixError> {
        if from_map.channels() != from.channels || to_map.channels() != to.channels {
            return Err(MixError::Incompatible(format!(
                "channel map does not match spec ({} vs {})",
                from_map.channels(),
                from.channels
            )));
        }
        // Table source → destination : dst[c] reçoit src[inverse[c]].
        let fwd = from_map.remap_table(to_map);
        let mut inverse = vec![0usize; to.channels as usize];
        for (dst_slot, inv) in inverse.iter_mut().enumerate() {
            *inv = fwd
                .iter()
                .position(|d| *d == dst_slot)
                .unwrap_or(dst_slot.min(from.channels as usize - 1));
        }
        Ok(Converter {
            from,
            to,
            remap: inverse,
            phase: 0.0,
            carry: None,
        })
    }

    /// Vrai si la conversion est l'identité.
    pub fn is_passthrough(&self) -> bool {
        self.from == self.to && self.remap.iter().enumerate().all(|(i, v)| i == *v)
    }

    pub fn from_spec(&self) -> &SampleSpec {
        &self.from
    }

    pub fn to_spec(&self) -> &SampleSpec {
        &self.to
    }

    /// Nombre d'octets d'entrée à fournir pour produire environ
    /// `out_bytes` octets de sortie.
    pub fn input_for_output(&self, out_bytes: usize) -> usize {
        let out_frames = out_bytes / self.to.frame_size();
        let in_frames =
            (out_frames as f64 * self.from.rate as f64 / self.to.rate as f64).ceil() as usize;
        in_frames * self.from.frame_size()
    }

    /// Convertit `chunk` (spec d'entrée) en un nouveau chunk (spec de
    /// sortie) alloué dans `pool`.
    pub fn convert(&mut self, chunk: &MemChunk, pool: &MemPool) -> Result<MemChunk, MixError> {
        let in_fs = self.from.frame_size();
        let in_ch = self.from.channels as usize;
        let in_ss = self.from.format.sample_size();
        let data = chunk.bytes();
        let in_frames = data.len() / in_fs;

        // Décodage en frames f32.
        let mut frames: Vec<Vec<f32>> = Vec::with_capacity(in_frames + 1);
        if let Some(carry) = self.carry.take() {
            frames.push(carry);
        }
        for f in 0..in_frames {
            let mut fr = Vec::with_capacity(in_ch);
            for c in 0..in_ch {
                let off = f * in_fs + c * in_ss;
                fr.push(decode(self.from.format, &data[off..off + in_ss]));
            }
            frames.push(fr);
        }
        drop(data);

        if frames.len() < 2 && self.from.rate != self.to.rate {
            // Pas assez de matière pour interpoler : on garde pour le
            // prochain appel.
            self.carry = frames.pop();
            return empty_chunk(pool, &self.to);
        }

        // Rééchantillonnage linéaire dans le domaine d'entrée.
        let out_frames: Vec<Vec<f32>> = if self.from.rate == self.to.rate {
            frames
        } else {
            let step = self.from.rate as f64 / self.to.rate as f64;
            let mut out = Vec::new();
            let mut pos = self.phase;
            while pos + 1.0 < frames.len() as f64 {
                let i = pos as usize;
                let frac = (pos - i as f64) as f32;
                let a = &frames[i];
                let b = &frames[i + 1];
                out.push(
                    (0..in_ch)
                        .map(|c| a[c] + (b[c] - a[c]) * frac)
                        .collect::<Vec<f32>>(),
                );
                pos += step;
            }
            // La dernière frame reste disponible pour le prochain chunk.
            self.phase = pos - (frames.len() - 1) as f64;
            self.carry = frames.last().cloned();
            out
        };

        // Remap de canaux + encodage.
        let out_fs = self.to.frame_size();
        let out_ss = self.to.format.sample_size();
        let out_ch = self.to.channels as usize;
        let out_bytes = out_frames.len() * out_fs;
        let mut block = alloc_block(pool, out_bytes)?;
        {
            let buf = block
                .try_mut()
                .ok_or_else(|| MixError::Incompatible("fresh block not writable".into()))?;
            for (f, fr) in out_frames.iter().enumerate() {
                for c in 0..out_ch {
                    let src = self.remap[c].min(fr.len() - 1);
                    let off = f * out_fs + c * out_ss;
                    encode(self.to.format, fr[src], &mut buf[off..off + out_ss]);
                }
            }
        }
        Ok(MemChunk::new(block))
    }
}

fn alloc_block(pool: &MemPool, len: usize) -> Result<sabcore::MemBlock, MixError> {
    if len == 0 {
        return Ok(pool.alloc_appended(0));
    }
    match pool.alloc(len) {
        Ok(b) => Ok(b),
        Err(sabcore::CoreError::PoolExhausted) | Err(sabcore::CoreError::TooLarge { .. }) => {
            Ok(pool.alloc_appended(len))
        }
        Err(e) => Err(e.into()),
    }
}

fn empty_chunk(pool: &MemPool, _spec: &SampleSpec) -> Result<MemChunk, MixError> {
    Ok(MemChunk::new(pool.alloc_appended(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sabcore::{ChannelMap, MemPool, SampleFormat};

    fn pool() -> MemPool {
        MemPool::new(64 * 1024, 16)
    }

    fn chunk_s16(pool: &MemPool, samples: &[i16]) -> MemChunk {
        let mut b = pool.alloc(samples.len() * 2).unwrap();
        {
            let d = b.try_mut().unwrap();
            for (i, s) in samples.iter().enumerate() {
                d[i * 2..i * 2 + 2].copy_from_slice(&s.to_le_bytes());
            }
        }
        MemChunk::new(b)
    }

    #[test]
    fn format_conversion_s16_to_f32() {
        let p = pool();
        let from = SampleSpec::new(SampleFormat::S16Le, 1, 8000).unwrap();
        let to = SampleSpec::new(SampleFormat::F32Le, 1, 8000).unwrap();
        let mut conv = Converter::new(
            from,
            &ChannelMap::default_for(1).unwrap(),
            to,
            &ChannelMap::default_for(1).unwrap(),
        )
        .unwrap();
        let out = conv.convert(&chunk_s16(&p, &[16384, -16384]), &p).unwrap();
        let data = out.bytes();
        let a = f32::from_le_bytes(data[0..4].try_into().unwrap());
        let b = f32::from_le_bytes(data[4..8].try_into().unwrap());
        assert!((a - 0.5).abs() < 0.01, "{a}");
        assert!((b + 0.5).abs() < 0.01, "{b}");
    }

    #[test]
    fn mono_to_stereo_duplicates() {
        let p = pool();
        let from = SampleSpec::new(SampleFormat::S16Le, 1, 8000).unwrap();
        let to = SampleSpec::new(SampleFormat::S16Le, 2, 8000).unwrap();
        let mut conv = Converter::new(
            from,
            &ChannelMap::default_for(1).unwrap(),
            to,
            &ChannelMap::default_for(2).unwrap(),
        )
        .unwrap();
        let out = conv.convert(&chunk_s16(&p, &[1000]), &p).unwrap();
        let data = out.bytes();
        assert_eq!(data.len(), 4);
        assert_eq!(i16::from_le_bytes([data[0], data[1]]), 1000);
        assert_eq!(i16::from_le_bytes([data[2], data[3]]), 1000);
    }

    #[test]
    fn upsampling_doubles_frames() {
        let p = pool();
        let from = SampleSpec::new(SampleFormat::S16Le, 1, 4000).unwrap();
        let to = SampleSpec::new(SampleFormat::S16Le, 1, 8000).unwrap();
        let mut conv = Converter::new(
            from,
            &ChannelMap::default_for(1).unwrap(),
            to,
            &ChannelMap::default_for(1).unwrap(),
        )
        .unwrap();
        let samples: Vec<i16> = (0..100).map(|i| i * 100).collect();
        let out = conv.convert(&chunk_s16(&p, &samples), &p).unwrap();
        let frames = out.length / 2;
        // 100 frames d'entrée → ~200 frames de sortie (bord exclus).
        assert!((195..=200).contains(&frames), "{frames}");
    }

    #[test]
    fn passthrough_detection() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap();
        let map = ChannelMap::default_for(2).unwrap();
        let conv = Converter::new(spec, &map, spec, &map).unwrap();
        assert!(conv.is_passthrough());
    }
}

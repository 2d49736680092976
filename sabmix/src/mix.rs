//! Mixage de plusieurs contributions dans un bloc de sortie.
//!
//! Arithmétique saturante par canal dans le format du sink. Les
//! contributions sont des vues de même longueur accompagnées de leur
//! volume par canal ; le volume doux du sink s'applique au résultat.

use sabcore::{CVolume, MemChunk, SampleSpec, Volume};

use crate::sample_util::{decode, encode};

/// Une contribution au mix.
pub struct MixInfo {
    pub chunk: MemChunk,
    /// Volume par canal, dans la géométrie du sink.
    pub volume: CVolume,
    /// Flux muet : contribution ignorée.
    pub muted: bool,
}

/// Mixe `inputs` dans `out` (longueur de `out` en octets, multiple de
/// la taille de frame de `spec`). `soft_volume` et `soft_muted` sont
/// ceux du sink.
///
/// Chaque échantillon de sortie est la somme saturée des échantillons
/// d'entrée multipliés par leur volume de flux puis par le volume doux
/// du sink.
pub fn mix_into(
    inputs: &[MixInfo],
    spec: &SampleSpec,
    out: &mut [u8],
    soft_volume: &CVolume,
    soft_muted: bool,
) {
    let sample_size = spec.format.sample_size();
    let channels = spec.channels as usize;
    let frame_size = sample_size * channels;
    let frames = out.len() / frame_size;

    if soft_muted || inputs.iter().all(|i| i.muted) {
        let byte = spec.format.silence_byte();
        out.fill(byte);
        return;
    }

    // Gains linéaires précalculés par (contribution, canal).
    let gains: Vec<Vec<f32>> = inputs
        .iter()
        .map(|i| {
            (0..channels)
                .map(|c| {
                    if i.muted {
                        0.0
                    } else {
                        (i.volume.get(c).multiply(soft_volume.get(c))).to_linear() as f32
                    }
                })
                .collect()
        })
        .collect();

    let datas: Vec<_> = inputs.iter().map(|i| i.chunk.bytes()).collect();

    for f in 0..frames {
        for c in 0..channels {
            let off = f * frame_size + c * sample_size;
            let mut acc = 0.0f32;
            for (i, data) in datas.iter().enumerate() {
                let end = off + sample_size;
                if end > data.len() {
                    continue;
                }
                let s = decode(spec.format, &data[off..end]);
                acc += s * gains[i][c];
            }
            encode(spec.format, acc, &mut out[off..off + sample_size]);
        }
    }
}

/// Applique `volume` (déjà composé avec le volume doux) à `data` en
/// place, format `spec`.
pub fn apply_volume(data: &mut [u8], spec: &SampleSpec, volume: &CVolume) {
    if volume.is_norm() {
        return;
    }
    let sample_size = spec.format.sample_size();
    let channels = spec.channels as usize;
    let frame_size = sample_size * channels;
    let gains: Vec<f32> = (0..channels)
        .map(|c| volume.get(c).to_linear() as f32)
        .collect();
    let frames = data.len() / frame_size;
    for f in 0..frames {
        for c in 0..channels {
            let off = f * frame_size + c * sample_size;
            let s = decode(spec.format, &data[off..off + sample_size]);
            encode(spec.format, s * gains[c], &mut data[off..off + sample_size]);
        }
    }
}

/// Produit du volume de flux et du volume doux, nul si l'un est muet.
pub fn effective_volume(stream: &CVolume, soft: &CVolume, muted: bool) -> CVolume {
    if muted {
        return CVolume::muted(stream.channels());
    }
    stream.multiply(soft)
}

/// Vrai si ce volume rend toute contribution inaudible.
pub fn is_effectively_muted(v: &CVolume) -> bool {
    v.values().iter().all(|x| *x == Volume::MUTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sabcore::{MemPool, SampleFormat};

    fn pool() -> MemPool {
        MemPool::new(4096, 16)
    }

    fn s16_chunk(pool: &MemPool, samples: &[i16]) -> MemChunk {
        let mut b = pool.alloc(samples.len() * 2).unwrap();
        {
            let data = b.try_mut().unwrap();
            for (i, s) in samples.iter().enumerate() {
                data[i * 2..i * 2 + 2].copy_from_slice(&s.to_le_bytes());
            }
        }
        MemChunk::new(b)
    }

    fn read_s16(data: &[u8]) -> Vec<i16> {
        data.chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    fn spec() -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap()
    }

    #[test]
    fn two_streams_sum() {
        let p = pool();
        let a = s16_chunk(&p, &[1000, -1000, 500, 250]);
        let b = s16_chunk(&p, &[100, 100, 100, 100]);
        let mut out = vec![0u8; 8];
        mix_into(
            &[
                MixInfo {
                    chunk: a,
                    volume: CVolume::norm(2),
                    muted: false,
                },
                MixInfo {
                    chunk: b,
                    volume: CVolume::norm(2),
                    muted: false,
                },
            ],
            &spec(),
            &mut out,
            &CVolume::norm(2),
            false,
        );
        let got = read_s16(&out);
        for (g, want) in got.iter().zip([1100, -900, 600, 350]) {
            assert!((g - want).abs() <= 2, "{got:?}");
        }
    }

    #[test]
    fn saturation_clamps() {
        let p = pool();
        let a = s16_chunk(&p, &[30000, -30000]);
        let b = s16_chunk(&p, &[30000, -30000]);
        let mut out = vec![0u8; 4];
        mix_into(
            &[
                MixInfo {
                    chunk: a,
                    volume: CVolume::norm(2),
                    muted: false,
                },
                MixInfo {
                    chunk: b,
                    volume: CVolume::norm(2),
                    muted: false,
                },
            ],
            &spec(),
            &mut out,
            &CVolume::norm(2),
            false,
        );
        let got = read_s16(&out);
        assert_eq!(got[0], 32767);
        assert_eq!(got[1], -32768);
    }

    #[test]
    fn per_channel_volume_applies() {
        let p = pool();
        let a = s16_chunk(&p, &[10000, 10000]);
        let half = CVolume::new(vec![Volume(0x8000), Volume::NORM]).unwrap();
        let mut out = vec![0u8; 4];
        mix_into(
            &[MixInfo {
                chunk: a,
                volume: half,
                muted: false,
            }],
            &spec(),
            &mut out,
            &CVolume::norm(2),
            false,
        );
        let got = read_s16(&out);
        assert!((got[0] - 5000).abs() <= 2, "{got:?}");
        assert!((got[1] - 10000).abs() <= 2, "{got:?}");
    }

    #[test]
    fn muted_everything_is_silence() {
        let p = pool();
        let a = s16_chunk(&p, &[10000, 10000]);
        let mut out = vec![0xffu8; 4];
        mix_into(
            &[MixInfo {
                chunk: a,
                volume: CVolume::norm(2),
                muted: false,
            }],
            &spec(),
            &mut out,
            &CVolume::norm(2),
            true,
        );
        assert_eq!(out, vec![0u8; 4]);
    }

    #[test]
    fn apply_volume_halves() {
        let spec = spec();
        let mut data = Vec::new();
        for s in [20000i16, -20000] {
            data.extend_from_slice(&s.to_le_bytes());
        }
        apply_volume(
            &mut data,
            &spec,
            &CVolume::uniform(2, Volume(0x8000)),
        );
        let got = read_s16(&data);
        assert!((got[0] - 10000).abs() <= 2);
        assert!((got[1] + 10000).abs() <= 2);
    }
}

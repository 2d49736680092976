//! Typed, self-describing serialisation of control payloads.
//!
//! Every field is preceded by a one-byte tag identifying its type.
//! Reading advances an internal cursor and fails with
//! [`WireError::Malformed`] on any tag mismatch or short read. All
//! integers are big-endian on the wire.

use sabcore::{
    ChannelMap, ChannelPosition, CVolume, Proplist, SampleFormat, SampleSpec, Volume,
};

use crate::error::WireError;
use crate::packet::Packet;

const TAG_STRING: u8 = b't';
const TAG_STRING_NULL: u8 = b'N';
const TAG_U32: u8 = b'L';
const TAG_S32: u8 = b'l';
const TAG_U16: u8 = b'S';
const TAG_S16: u8 = b's';
const TAG_U8: u8 = b'B';
const TAG_S8: u8 = b'b';
const TAG_U64: u8 = b'R';
const TAG_S64: u8 = b'r';
const TAG_SAMPLE_SPEC: u8 = b'a';
const TAG_CHANNEL_MAP: u8 = b'm';
const TAG_CVOLUME: u8 = b'v';
const TAG_TIMEVAL: u8 = b'T';
const TAG_ARBITRARY: u8 = b'x';
const TAG_BOOLEAN_TRUE: u8 = b'1';
const TAG_BOOLEAN_FALSE: u8 = b'0';
const TAG_PROPLIST: u8 = b'P';

/// A tag-struct being written or read.
///
/// # Examples
///
/// ```
/// use sabwire::TagStruct;
///
/// let mut ts = TagStruct::new();
/// ts.put_u32(44100).put_string(Some("null"));
///
/// let mut r = TagStruct::from_bytes(ts.as_bytes().to_vec());
/// assert_eq!(r.get_u32().unwrap(), 44100);
/// assert_eq!(r.get_string().unwrap().as_deref(), Some("null"));
/// assert!(r.eof());
/// ```
#[derive(Debug, Default, Clone)]
pub struct TagStruct {
    data: Vec<u8>,
    rindex: usize,
}

impl TagStruct {
    pub fn new() -> Self {
        TagStruct::default()
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        TagStruct { data, rindex: 0 }
    }

    pub fn from_packet(packet: &Packet) -> Self {
        TagStruct {
            data: packet.data().to_vec(),
            rindex: 0,
        }
    }

    pub fn into_packet(self) -> Packet {
        Packet::new(self.data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// True once the read cursor has consumed every byte.
    pub fn eof(&self) -> bool {
        self.rindex >= self.data.len()
    }

    // ---- writing ----------------------------------------------------

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.data.push(TAG_U32);
        self.data.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_s32(&mut self, v: i32) -> &mut Self {
        self.data.push(TAG_S32);
        self.data.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.data.push(TAG_U16);
        self.data.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_s16(&mut self, v: i16) -> &mut Self {
        self.data.push(TAG_S16);
        self.data.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.data.push(TAG_U8);
        self.data.push(v);
        self
    }

    pub fn put_s8(&mut self, v: i8) -> &mut Self {
        self.data.push(TAG_S8);
        self.data.push(v as u8);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.data.push(TAG_U64);
        self.data.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_s64(&mut self, v: i64) -> &mut Self {
        self.data.push(TAG_S64);
        self.data.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.data
            .push(if v { TAG_BOOLEAN_TRUE } else { TAG_BOOLEAN_FALSE });
        self
    }

    /// NUL-terminated UTF-8 string; `None` writes the nil-string tag.
    pub fn put_string(&mut self, v: Option<&str>) -> &mut Self {
        match v {
            Some(s) => {
                self.data.push(TAG_STRING);
                self.data.extend_from_slice(s.as_bytes());
                self.data.push(0);
            }
            None => self.data.push(TAG_STRING_NULL),
        }
        self
    }

    pub fn put_arbitrary(&mut self, v: &[u8]) -> &mut Self {
        self.data.push(TAG_ARBITRARY);
        self.data.extend_from_slice(&(v.len() as u32).to_be_bytes());
        self.data.extend_from_slice(v);
        self
    }

    pub fn put_sample_spec(&mut self, spec: &SampleSpec) -> &mut Self {
        self.data.push(TAG_SAMPLE_SPEC);
        self.data.push(spec.format as u8);
        self.data.push(spec.channels);
        self.data.extend_from_slice(&spec.rate.to_be_bytes());
        self
    }

    pub fn put_channel_map(&mut self, map: &ChannelMap) -> &mut Self {
        self.data.push(TAG_CHANNEL_MAP);
        self.data.push(map.channels());
        for p in map.positions() {
            self.data.push(*p as u8);
        }
        self
    }

    pub fn put_cvolume(&mut self, v: &CVolume) -> &mut Self {
        self.data.push(TAG_CVOLUME);
        self.data.push(v.channels());
        for vol in v.values() {
            self.data.extend_from_slice(&vol.0.to_be_bytes());
        }
        self
    }

    pub fn put_timeval(&mut self, secs: u32, usecs: u32) -> &mut Self {
        self.data.push(TAG_TIMEVAL);
        self.data.extend_from_slice(&secs.to_be_bytes());
        self.data.extend_from_slice(&usecs.to_be_bytes());
        self
    }

    /// Proplist: iterated `(string key, u32 length, arbitrary data)`,
    /// terminated by a nil string.
    pub fn put_proplist(&mut self, p: &Proplist) -> &mut Self {
        self.data.push(TAG_PROPLIST);
        for (k, v) in p.iter() {
            self.put_string(Some(k));
            self.put_u32(v.len() as u32);
            self.put_arbitrary(v);
        }
        self.put_string(None);
        self
    }

    // ---- reading ----------------------------------------------------

    fn want(&mut self, n: usize) -> Result<&[u8], WireError> {
        if self.rindex + n > self.data.len() {
            return Err(WireError::Malformed(format!(
                "short read: want {} bytes at {}, have {}",
                n,
                self.rindex,
                self.data.len()
            )));
        }
        let s = &self.data[self.rindex..self.rindex + n];
        self.rindex += n;
        Ok(s)
    }

    fn expect_tag(&mut self, tag: u8) -> Result<(), WireError> {
        let got = self.want(1)?[0];
        if got != tag {
            self.rindex -= 1;
            return Err(WireError::Malformed(format!(
                "expected tag '{}', got '{}'",
                tag as char, got as char
            )));
        }
        Ok(())
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        self.expect_tag(TAG_U32)?;
        Ok(u32::from_be_bytes(self.want(4)?.try_into().unwrap()))
    }

    pub fn get_s32(&mut self) -> Result<i32, WireError> {
        self.expect_tag(TAG_S32)?;
        Ok(i32::from_be_bytes(self.want(4)?.try_into().unwrap()))
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        self.expect_tag(TAG_U16)?;
        Ok(u16::from_be_bytes(self.want(2)?.try_into().unwrap()))
    }

    pub fn get_s16(&mut self) -> Result<i16, WireError> {
        self.expect_tag(TAG_S16)?;
        Ok(i16::from_be_bytes(self.want(2)?.try_into().unwrap()))
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        self.expect_tag(TAG_U8)?;
        Ok(self.want(1)?[0])
    }

    pub fn get_s8(&mut self) -> Result<i8, WireError> {
        self.expect_tag(TAG_S8)?;
        Ok(self.want(1)?[0] as i8)
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        self.expect_tag(TAG_U64)?;
        Ok(u64::from_be_bytes(self.want(8)?.try_into().unwrap()))
    }

    pub fn get_s64(&mut self) -> Result<i64, WireError> {
        self.expect_tag(TAG_S64)?;
        Ok(i64::from_be_bytes(self.want(8)?.try_into().unwrap()))
    }

    pub fn get_bool(&mut self) -> Result<bool, WireError> {
        let got = self.want(1)?[0];
        match got {
            TAG_BOOLEAN_TRUE => Ok(true),
            TAG_BOOLEAN_FALSE => Ok(false),
            _ => {
                self.rindex -= 1;
                Err(WireError::Malformed(format!(
                    "expected boolean, got '{}'",
                    got as char
                )))
            }
        }
    }

    pub fn get_string(&mut self) -> Result<Option<String>, WireError> {
        let got = self.want(1)?[0];
        match got {
            TAG_STRING_NULL => Ok(None),
            TAG_STRING => {
                let rest = &self.data[self.rindex..];
                let nul = rest
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or_else(|| WireError::Malformed("unterminated string".into()))?;
                let s = std::str::from_utf8(&rest[..nul])
                    .map_err(|_| WireError::Malformed("string is not UTF-8".into()))?
                    .to_owned();
                self.rindex += nul + 1;
                Ok(Some(s))
            }
            _ => {
                self.rindex -= 1;
                Err(WireError::Malformed(format!(
                    "expected string, got '{}'",
                    got as char
                )))
            }
        }
    }

    /// Non-nil string shortcut.
    pub fn get_string_non_null(&mut self) -> Result<String, WireError> {
        self.get_string()?
            .ok_or_else(|| WireError::Malformed("unexpected nil string".into()))
    }

    pub fn get_arbitrary(&mut self) -> Result<Vec<u8>, WireError> {
        self.expect_tag(TAG_ARBITRARY)?;
        let len = u32::from_be_bytes(self.want(4)?.try_into().unwrap()) as usize;
        Ok(self.want(len)?.to_vec())
    }

    pub fn get_sample_spec(&mut self) -> Result<SampleSpec, WireError> {
        self.expect_tag(TAG_SAMPLE_SPEC)?;
        let raw = self.want(6)?;
        let format = SampleFormat::from_wire(raw[0])
            .ok_or_else(|| WireError::Malformed(format!("unknown sample format {}", raw[0])))?;
        let channels = raw[1];
        let rate = u32::from_be_bytes(raw[2..6].try_into().unwrap());
        SampleSpec::new(format, channels, rate)
            .map_err(|e| WireError::Malformed(e.to_string()))
    }

    pub fn get_channel_map(&mut self) -> Result<ChannelMap, WireError> {
        self.expect_tag(TAG_CHANNEL_MAP)?;
        let channels = self.want(1)?[0] as usize;
        let raw = self.want(channels)?;
        let positions = raw
            .iter()
            .map(|b| {
                ChannelPosition::from_wire(*b)
                    .ok_or_else(|| WireError::Malformed(format!("unknown channel position {b}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        ChannelMap::new(positions).map_err(|e| WireError::Malformed(e.to_string()))
    }

    pub fn get_cvolume(&mut self) -> Result<CVolume, WireError> {
        self.expect_tag(TAG_CVOLUME)?;
        let channels = self.want(1)?[0] as usize;
        let raw = self.want(channels * 4)?.to_vec();
        let values = raw
            .chunks_exact(4)
            .map(|c| Volume(u32::from_be_bytes(c.try_into().unwrap())))
            .collect();
        CVolume::new(values).map_err(|e| WireError::Malformed(e.to_string()))
    }

    pub fn get_timeval(&mut self) -> Result<(u32, u32), WireError> {
        self.expect_tag(TAG_TIMEVAL)?;
        let raw = self.want(8)?;
        Ok((
            u32::from_be_bytes(raw[0..4].try_into().unwrap()),
            u32::from_be_bytes(raw[4..8].try_into().unwrap()),
        ))
    }

    pub fn get_proplist(&mut self) -> Result<Proplist, WireError> {
        self.expect_tag(TAG_PROPLIST)?;
        let mut p = Proplist::new();
        loop {
            match self.get_string()? {
                None => return Ok(p),
                Some(key) => {
                    let len = self.get_u32()? as usize;
                    let data = self.get_arbitrary()?;
                    if data.len() != len {
                        return Err(WireError::Malformed(format!(
                            "proplist entry '{key}': length {len} vs {} data bytes",
                            data.len()
                        )));
                    }
                    p.set(&key, data);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        let mut t = TagStruct::new();
        t.put_u32(0xdead_beef)
            .put_s32(-17)
            .put_u16(777)
            .put_s16(-2)
            .put_u8(9)
            .put_s8(-9)
            .put_u64(1 << 40)
            .put_s64(-(1 << 40))
            .put_bool(true)
            .put_bool(false);
        let mut r = TagStruct::from_bytes(t.as_bytes().to_vec());
        assert_eq!(r.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.get_s32().unwrap(), -17);
        assert_eq!(r.get_u16().unwrap(), 777);
        assert_eq!(r.get_s16().unwrap(), -2);
        assert_eq!(r.get_u8().unwrap(), 9);
        assert_eq!(r.get_s8().unwrap(), -9);
        assert_eq!(r.get_u64().unwrap(), 1 << 40);
        assert_eq!(r.get_s64().unwrap(), -(1 << 40));
        assert!(r.get_bool().unwrap());
        assert!(!r.get_bool().unwrap());
        assert!(r.eof());
    }

    #[test]
    fn strings_and_blobs() {
        let mut t = TagStruct::new();
        t.put_string(Some("hello"))
            .put_string(None)
            .put_arbitrary(&[1, 2, 3]);
        let mut r = TagStruct::from_bytes(t.as_bytes().to_vec());
        assert_eq!(r.get_string().unwrap().as_deref(), Some("hello"));
        assert_eq!(r.get_string().unwrap(), None);
        assert_eq!(r.get_arbitrary().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn audio_types_roundtrip() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap();
        let map = ChannelMap::default_for(2).unwrap();
        let vol = CVolume::new(vec![Volume::NORM, Volume(0x8000)]).unwrap();
        let mut t = TagStruct::new();
        t.put_sample_spec(&spec)
            .put_channel_map(&map)
            .put_cvolume(&vol)
            .put_timeval(12, 34);
        let mut r = TagStruct::from_bytes(t.as_bytes().to_vec());
        assert_eq!(r.get_sample_spec().unwrap(), spec);
        assert_eq!(r.get_channel_map().unwrap(), map);
        assert_eq!(r.get_cvolume().unwrap(), vol);
        assert_eq!(r.get_timeval().unwrap(), (12, 34));
    }

    #[test]
    fn proplist_roundtrip() {
        let p = Proplist::from_pairs([("application.name", "pacat"), ("media.role", "music")]);
        let mut t = TagStruct::new();
        t.put_proplist(&p);
        let mut r = TagStruct::from_bytes(t.as_bytes().to_vec());
        assert_eq!(r.get_proplist().unwrap(), p);
        assert!(r.eof());
    }

    #[test]
    fn type_mismatch_is_malformed_and_rewinds() {
        let mut t = TagStruct::new();
        t.put_u32(5);
        let mut r = TagStruct::from_bytes(t.as_bytes().to_vec());
        assert!(matches!(r.get_string(), Err(WireError::Malformed(_))));
        // The failed read did not consume the field.
        assert_eq!(r.get_u32().unwrap(), 5);
    }

    #[test]
    fn truncated_data_is_malformed() {
        let mut t = TagStruct::new();
        t.put_u32(5);
        let mut bytes = t.as_bytes().to_vec();
        bytes.truncate(3);
        let mut r = TagStruct::from_bytes(bytes);
        assert!(matches!(r.get_u32(), Err(WireError::Malformed(_))));
    }
}

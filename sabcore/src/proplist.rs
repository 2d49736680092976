//! Liste de propriétés : map ordonnée `clé → octets` attachée aux
//! objets du serveur (clients, flux, périphériques).

use md5::{Digest, Md5};

/// Clés usuelles.
pub mod keys {
    pub const APPLICATION_NAME: &str = "application.name";
    pub const APPLICATION_PROCESS_ID: &str = "application.process.id";
    pub const APPLICATION_PROCESS_BINARY: &str = "application.process.binary";
    pub const MEDIA_NAME: &str = "media.name";
    pub const MEDIA_ROLE: &str = "media.role";
    pub const DEVICE_DESCRIPTION: &str = "device.description";
    pub const DEVICE_CLASS: &str = "device.class";
    pub const DEVICE_STRING: &str = "device.string";
}

/// Mode de fusion pour [`Proplist::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Remplace tout le contenu par `other`.
    Set,
    /// Ajoute les clés de `other` absentes de `self`.
    Merge,
    /// Écrase les clés communes, ajoute les absentes.
    Replace,
}

/// Map ordonnée `String → Vec<u8>`.
///
/// L'ordre d'insertion est préservé, y compris sur le fil du protocole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proplist {
    entries: Vec<(String, Vec<u8>)>,
}

impl Proplist {
    pub fn new() -> Self {
        Proplist::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut p = Proplist::new();
        for (k, v) in pairs {
            p.set_str(&k.into(), &v.into());
        }
        p
    }

    /// Écrit une valeur binaire.
    pub fn set(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key.to_owned(), value));
        }
    }

    /// Écrit une valeur texte (stockée avec son NUL final, comme sur le
    /// fil).
    pub fn set_str(&mut self, key: &str, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.set(key, bytes);
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Valeur texte : octets UTF-8 valides terminés par NUL.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        let raw = self.get(key)?;
        let raw = raw.strip_suffix(&[0u8]).unwrap_or(raw);
        std::str::from_utf8(raw).ok()
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        before != self.entries.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn update(&mut self, mode: UpdateMode, other: &Proplist) {
        match mode {
            UpdateMode::Set => {
                self.entries = other.entries.clone();
            }
            UpdateMode::Merge => {
                for (k, v) in &other.entries {
                    if !self.contains(k) {
                        self.entries.push((k.clone(), v.clone()));
                    }
                }
            }
            UpdateMode::Replace => {
                for (k, v) in &other.entries {
                    self.set(k, v.clone());
                }
            }
        }
    }

    /// Identifiant stable dérivé du contenu : digest des entrées triées.
    ///
    /// Sert de nom de repli quand aucune propriété nominative n'est
    /// disponible ; deux proplists égales donnent le même identifiant.
    pub fn digest(&self) -> String {
        let mut sorted: Vec<_> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut hasher = Md5::new();
        for (k, v) in sorted {
            hasher.update(k.as_bytes());
            hasher.update([0u8]);
            hasher.update(v);
        }
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Display for Proplist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (k, _)) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match self.get_str(k) {
                Some(v) => write!(f, "{k} = \"{v}\"")?,
                None => write!(f, "{k} = <binary>")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_roundtrip() {
        let mut p = Proplist::new();
        p.set_str(keys::APPLICATION_NAME, "pacat");
        assert_eq!(p.get_str(keys::APPLICATION_NAME), Some("pacat"));
        assert_eq!(
            p.get(keys::APPLICATION_NAME),
            Some(b"pacat\0".as_slice())
        );
    }

    #[test]
    fn update_modes() {
        let mut a = Proplist::from_pairs([("x", "1"), ("y", "2")]);
        let b = Proplist::from_pairs([("y", "9"), ("z", "3")]);

        let mut m = a.clone();
        m.update(UpdateMode::Merge, &b);
        assert_eq!(m.get_str("y"), Some("2"));
        assert_eq!(m.get_str("z"), Some("3"));

        let mut r = a.clone();
        r.update(UpdateMode::Replace, &b);
        assert_eq!(r.get_str("y"), Some("9"));

        a.update(UpdateMode::Set, &b);
        assert!(!a.contains("x"));
    }

    #[test]
    fn digest_is_order_independent() {
        let a = Proplist::from_pairs([("x", "1"), ("y", "2")]);
        let b = Proplist::from_pairs([("y", "2"), ("x", "1")]);
        assert_eq!(a.digest(), b.digest());
        let c = Proplist::from_pairs([("x", "1")]);
        assert_ne!(a.digest(), c.digest());
    }
}

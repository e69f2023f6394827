use std::collections::BTreeMap;

use bendy::{
    decoding::{FromBencode, Object, ResultExt},
    encoding::ToBencode,
};

use crate::error::Error;

/// The extension protocol handshake dictionary.
///
/// The `m` dict maps extension names to the message id the sender will
/// accept them under. A zero id disables a previously enabled extension.
/// Every other key is advisory; unknown keys are skipped on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to message id. Id 0 disables.
    pub m: BTreeMap<String, u8>,
    /// Client name and version.
    pub v: Option<String>,
    /// Number of outstanding request messages the sender supports.
    pub reqq: Option<u16>,
    /// Size of the info dictionary, added by BEP 9.
    pub metadata_size: Option<u32>,
}

impl ExtensionHandshake {
    /// A handshake enabling `added` under their ids and disabling `removed`.
    pub fn new<A, R>(added: A, removed: R) -> Self
    where
        A: IntoIterator<Item = (String, u8)>,
        R: IntoIterator<Item = String>,
    {
        let mut m: BTreeMap<String, u8> = added.into_iter().collect();
        for name in removed {
            m.insert(name, 0);
        }
        Self { m, ..Default::default() }
    }

    /// Extension names this handshake enables.
    pub fn added(&self) -> impl Iterator<Item = &str> {
        self.m
            .iter()
            .filter(|(_, &id)| id != 0)
            .map(|(name, _)| name.as_str())
    }

    /// Extension names this handshake disables.
    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.m
            .iter()
            .filter(|(_, &id)| id == 0)
            .map(|(name, _)| name.as_str())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(self.to_bencode()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self::from_bencode(bytes)?)
    }
}

/// The `m` dict of the handshake, emitted with its names as keys.
struct MessageIds<'a>(&'a BTreeMap<String, u8>);

impl ToBencode for MessageIds<'_> {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            for (name, id) in self.0 {
                e.emit_pair(name.as_bytes(), id)?;
            }
            Ok(())
        })
    }
}

impl ToBencode for ExtensionHandshake {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"m", MessageIds(&self.m))?;
            if let Some(metadata_size) = self.metadata_size {
                e.emit_pair(b"metadata_size", metadata_size)?;
            }
            if let Some(reqq) = self.reqq {
                e.emit_pair(b"reqq", reqq)?;
            }
            if let Some(v) = &self.v {
                e.emit_pair(b"v", v)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for ExtensionHandshake {
    fn decode_bencode_object(
        object: Object,
    ) -> Result<Self, bendy::decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut m = BTreeMap::new();
        let mut v = None;
        let mut reqq = None;
        let mut metadata_size = None;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"m", value) => {
                    let mut inner = value.try_into_dictionary()?;
                    while let Some((name, id)) = inner.next_pair()? {
                        let name = String::from_utf8_lossy(name).into_owned();
                        let id = u8::decode_bencode_object(id).context("m")?;
                        m.insert(name, id);
                    }
                }
                (b"metadata_size", value) => {
                    metadata_size = u32::decode_bencode_object(value)
                        .context("metadata_size")
                        .map(Some)?;
                }
                (b"reqq", value) => {
                    reqq = u16::decode_bencode_object(value)
                        .context("reqq")
                        .map(Some)?;
                }
                (b"v", value) => {
                    v = String::decode_bencode_object(value)
                        .context("v")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        Ok(Self { m, v, reqq, metadata_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut handshake = ExtensionHandshake::new(
            [("elastic".to_owned(), 21u8)],
            ["merkle".to_owned()],
        );
        handshake.v = Some("peerwire 0.1".to_owned());
        handshake.reqq = Some(50);

        let bytes = handshake.to_bytes().unwrap();
        let decoded = ExtensionHandshake::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, handshake);
        assert_eq!(decoded.added().collect::<Vec<_>>(), ["elastic"]);
        assert_eq!(decoded.removed().collect::<Vec<_>>(), ["merkle"]);
    }

    #[test]
    fn unknown_keys_are_skipped() {
        // d1:md11:ut_metadatai3ee1:pi6881e4:reqqi512ee
        let bytes =
            b"d1:md11:ut_metadatai3ee1:pi6881e4:reqqi512ee";

        let handshake = ExtensionHandshake::from_bytes(bytes).unwrap();

        assert_eq!(handshake.m.get("ut_metadata"), Some(&3));
        assert_eq!(handshake.reqq, Some(512));
        assert_eq!(handshake.v, None);
    }

    #[test]
    fn zero_id_means_removed() {
        let bytes = b"d1:md7:elastici0eee";
        let handshake = ExtensionHandshake::from_bytes(bytes).unwrap();

        assert_eq!(handshake.added().count(), 0);
        assert_eq!(handshake.removed().collect::<Vec<_>>(), ["elastic"]);
    }
}

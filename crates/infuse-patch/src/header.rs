//! Patch file header.
//!
//! Fixed 160 bytes, little-endian: magic, three `(length, crc)` validation
//! pairs (original image, constructed image, patch body), a 128-byte write
//! cache region of `[len][bytes]` entries terminated by a zero length, and
//! finally a CRC over everything before it.

use crate::PatchError;

pub const PATCH_MAGIC: u32 = 0xBA85_4092;

/// Size of the embedded write-cache region.
pub const CACHE_REGION: usize = 128;
/// Maximum number of cache entries (a cached-write index is one nibble).
pub const CACHE_MAX_ENTRIES: usize = 16;

/// `(length, crc)` pair validating one byte array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayValidation {
    pub length: u32,
    pub crc: u32,
}

impl ArrayValidation {
    pub fn of(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            crc: crc32fast::hash(data),
        }
    }
}

/// Decoded patch header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchHeader {
    pub original: ArrayValidation,
    pub constructed: ArrayValidation,
    pub body: ArrayValidation,
    pub write_cache: Vec<Vec<u8>>,
}

impl PatchHeader {
    pub const WIRE_LEN: usize = 4 + 3 * 8 + CACHE_REGION + 4;

    /// Serialize, computing the header CRC.
    ///
    /// The cache entries are validated by the generator: ≤ 16 entries and
    /// the encoded region (one length byte per entry) within 128 bytes.
    pub fn to_wire(&self) -> Result<[u8; Self::WIRE_LEN], PatchError> {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&PATCH_MAGIC.to_le_bytes());
        for (i, pair) in [self.original, self.constructed, self.body].iter().enumerate() {
            let at = 4 + i * 8;
            out[at..at + 4].copy_from_slice(&pair.length.to_le_bytes());
            out[at + 4..at + 8].copy_from_slice(&pair.crc.to_le_bytes());
        }

        let mut at = 28;
        for entry in &self.write_cache {
            if at + 1 + entry.len() > 28 + CACHE_REGION {
                return Err(PatchError::CacheOverflow(CACHE_REGION));
            }
            out[at] = entry.len() as u8;
            out[at + 1..at + 1 + entry.len()].copy_from_slice(entry);
            at += 1 + entry.len();
        }

        let crc = crc32fast::hash(&out[..Self::WIRE_LEN - 4]);
        out[Self::WIRE_LEN - 4..].copy_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Parse and validate the header portion of a patch file.
    pub fn parse(patch: &[u8]) -> Result<Self, PatchError> {
        if patch.len() < Self::WIRE_LEN {
            return Err(PatchError::TooShort);
        }
        let magic = u32::from_le_bytes(patch[0..4].try_into().expect("4 bytes"));
        if magic != PATCH_MAGIC {
            return Err(PatchError::HeaderMagic { found: magic });
        }

        let expected = u32::from_le_bytes(
            patch[Self::WIRE_LEN - 4..Self::WIRE_LEN]
                .try_into()
                .expect("4 bytes"),
        );
        let computed = crc32fast::hash(&patch[..Self::WIRE_LEN - 4]);
        if expected != computed {
            return Err(PatchError::HeaderCrc { expected, computed });
        }

        let pair = |at: usize| ArrayValidation {
            length: u32::from_le_bytes(patch[at..at + 4].try_into().expect("4 bytes")),
            crc: u32::from_le_bytes(patch[at + 4..at + 8].try_into().expect("4 bytes")),
        };

        let mut write_cache = Vec::new();
        let cache_region = &patch[28..28 + CACHE_REGION];
        let mut at = 0;
        while at < cache_region.len() && cache_region[at] != 0 {
            let len = usize::from(cache_region[at]);
            if at + 1 + len > cache_region.len() {
                return Err(PatchError::CacheOverflow(CACHE_REGION));
            }
            write_cache.push(cache_region[at + 1..at + 1 + len].to_vec());
            at += 1 + len;
        }

        Ok(Self {
            original: pair(4),
            constructed: pair(12),
            body: pair(20),
            write_cache,
        })
    }

    /// Validate the patch body against the header's `(length, crc)` pair and
    /// return it.
    pub fn validated_body<'a>(&self, patch: &'a [u8]) -> Result<&'a [u8], PatchError> {
        let body = &patch[Self::WIRE_LEN..];
        if body.len() as u32 != self.body.length {
            return Err(PatchError::BodyLength {
                expected: self.body.length,
                found: body.len() as u32,
            });
        }
        let computed = crc32fast::hash(body);
        if computed != self.body.crc {
            return Err(PatchError::BodyCrc {
                expected: self.body.crc,
                computed,
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> PatchHeader {
        PatchHeader {
            original: ArrayValidation::of(b"original"),
            constructed: ArrayValidation::of(b"constructed"),
            body: ArrayValidation::of(b"body"),
            write_cache: vec![b"cached-one".to_vec(), b"two".to_vec()],
        }
    }

    #[test]
    fn header_is_160_bytes() {
        assert_eq!(PatchHeader::WIRE_LEN, 160);
    }

    #[test]
    fn wire_round_trip() {
        let hdr = header();
        let wire = hdr.to_wire().unwrap();
        assert_eq!(PatchHeader::parse(&wire).unwrap(), hdr);
    }

    #[test]
    fn bad_magic_detected() {
        let mut wire = header().to_wire().unwrap();
        wire[0] ^= 0xFF;
        assert!(matches!(
            PatchHeader::parse(&wire),
            Err(PatchError::HeaderMagic { .. })
        ));
    }

    #[test]
    fn every_header_byte_is_covered_by_crc() {
        let wire = header().to_wire().unwrap();
        for at in 0..PatchHeader::WIRE_LEN - 4 {
            let mut tampered = wire;
            tampered[at] ^= 0x01;
            assert!(
                PatchHeader::parse(&tampered).is_err(),
                "byte {at} tamper not detected"
            );
        }
    }

    #[test]
    fn cache_must_fit_region() {
        let hdr = PatchHeader {
            write_cache: vec![vec![0xAA; 120], vec![0xBB; 120]],
            ..header()
        };
        assert_eq!(hdr.to_wire(), Err(PatchError::CacheOverflow(CACHE_REGION)));
    }

    #[test]
    fn body_validation() {
        let hdr = header();
        let mut patch = hdr.to_wire().unwrap().to_vec();
        patch.extend_from_slice(b"body");
        assert_eq!(hdr.validated_body(&patch).unwrap(), b"body");

        let mut short = patch.clone();
        short.pop();
        assert!(matches!(
            hdr.validated_body(&short),
            Err(PatchError::BodyLength { .. })
        ));

        let mut flipped = patch.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x20;
        assert!(matches!(
            hdr.validated_body(&flipped),
            Err(PatchError::BodyCrc { .. })
        ));
    }
}

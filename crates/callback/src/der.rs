//! Minimal DER decoder for RSA `SubjectPublicKeyInfo`.
//!
//! Only the structure the signing service publishes is understood:
//!
//! ```text
//! SubjectPublicKeyInfo ::= SEQUENCE {
//!     algorithm        SEQUENCE { OID rsaEncryption, NULL OPTIONAL },
//!     subjectPublicKey BIT STRING {            -- 0 unused bits
//!         RSAPublicKey ::= SEQUENCE { modulus INTEGER, publicExponent INTEGER }
//!     }
//! }
//! ```
//!
//! Lengths may use the short form or the one- and two-octet long forms
//! (`0x81 LL`, `0x82 HH LL`). Anything else is rejected.

use crate::error::{CallbackError, Result};

/// DER encoding of the rsaEncryption OID (`1.2.840.113549.1.1.1`), without tag and length.
pub const RSA_ENCRYPTION_OID: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01];

const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;

/// Modulus and public exponent as minimal big-endian magnitudes.
#[derive(Clone, PartialEq, Eq)]
pub struct RsaPublicComponents {
    /// Modulus `n`, without the DER sign octet.
    pub modulus: Vec<u8>,
    /// Public exponent `e`, without the DER sign octet.
    pub exponent: Vec<u8>,
}

impl std::fmt::Debug for RsaPublicComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaPublicComponents")
            .field("modulus_bits", &(self.modulus.len() * 8))
            .field("exponent", &self.exponent)
            .finish()
    }
}

/// Forward-only cursor over a DER buffer.
struct DerReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn read_byte(&mut self, what: &str) -> Result<u8> {
        let byte = *self
            .input
            .get(self.pos)
            .ok_or_else(|| CallbackError::parse(format!("truncated {what}")))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.input.len())
            .ok_or_else(|| {
                CallbackError::parse(format!(
                    "truncated {what}: need {len} bytes, {} available",
                    self.input.len() - self.pos
                ))
            })?;
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_length(&mut self, what: &str) -> Result<usize> {
        match self.read_byte(what)? {
            short @ 0x00..=0x7F => Ok(usize::from(short)),
            0x81 => Ok(usize::from(self.read_byte(what)?)),
            0x82 => {
                let hi = self.read_byte(what)?;
                let lo = self.read_byte(what)?;
                Ok(usize::from(u16::from_be_bytes([hi, lo])))
            },
            0x80 => Err(CallbackError::parse(format!("indefinite length in {what}"))),
            other => Err(CallbackError::parse(format!(
                "unsupported length form 0x{other:02x} in {what}"
            ))),
        }
    }

    /// Reads one tag-length-value triple and returns its contents.
    fn read_tlv(&mut self, tag: u8, what: &str) -> Result<&'a [u8]> {
        let actual = self.read_byte(what)?;
        if actual != tag {
            return Err(CallbackError::parse(format!(
                "expected tag 0x{tag:02x} for {what}, found 0x{actual:02x}"
            )));
        }
        let len = self.read_length(what)?;
        self.read_bytes(len, what)
    }

    fn expect_end(&self, what: &str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CallbackError::parse(format!(
                "{} trailing bytes after {what}",
                self.input.len() - self.pos
            )))
        }
    }
}

/// Decodes an RSA `SubjectPublicKeyInfo` into its modulus and exponent.
///
/// The leading zero octet DER adds to keep a positive INTEGER positive is
/// stripped from both values.
///
/// # Errors
///
/// Returns [`CallbackError::Parse`] if:
/// - Any tag differs from the expected structure
/// - The algorithm OID is not rsaEncryption
/// - The BIT STRING declares unused bits
/// - A length uses an unsupported form or overruns its parent
/// - The modulus or exponent is empty or negative
/// - Bytes follow the outer SEQUENCE
///
/// # Examples
///
/// ```
/// use mmt_common_callback::der::decode_rsa_public_key;
///
/// // A DER blob with the wrong OID is rejected, never half-decoded.
/// let ec_key = [0x30, 0x0b, 0x30, 0x09, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
/// assert!(decode_rsa_public_key(&ec_key).is_err());
/// ```
pub fn decode_rsa_public_key(der: &[u8]) -> Result<RsaPublicComponents> {
    let mut outer = DerReader::new(der);
    let spki = outer.read_tlv(TAG_SEQUENCE, "SubjectPublicKeyInfo")?;
    outer.expect_end("SubjectPublicKeyInfo")?;

    let mut spki = DerReader::new(spki);
    let algorithm = spki.read_tlv(TAG_SEQUENCE, "AlgorithmIdentifier")?;
    check_algorithm(algorithm)?;

    let bits = spki.read_tlv(TAG_BIT_STRING, "subjectPublicKey")?;
    spki.expect_end("subjectPublicKey")?;

    let (&unused_bits, key) =
        bits.split_first().ok_or_else(|| CallbackError::parse("empty subjectPublicKey"))?;
    if unused_bits != 0x00 {
        return Err(CallbackError::parse(format!(
            "subjectPublicKey declares {unused_bits} unused bits"
        )));
    }

    let mut key = DerReader::new(key);
    let rsa_key = key.read_tlv(TAG_SEQUENCE, "RSAPublicKey")?;
    key.expect_end("RSAPublicKey")?;

    let mut rsa_key = DerReader::new(rsa_key);
    let modulus = rsa_key.read_tlv(TAG_INTEGER, "modulus")?;
    let exponent = rsa_key.read_tlv(TAG_INTEGER, "publicExponent")?;
    rsa_key.expect_end("publicExponent")?;

    Ok(RsaPublicComponents {
        modulus: unsigned_magnitude(modulus, "modulus")?,
        exponent: unsigned_magnitude(exponent, "publicExponent")?,
    })
}

fn check_algorithm(algorithm: &[u8]) -> Result<()> {
    let mut algorithm = DerReader::new(algorithm);
    let oid = algorithm.read_tlv(TAG_OID, "algorithm OID")?;
    if oid != RSA_ENCRYPTION_OID {
        return Err(CallbackError::parse(format!(
            "unsupported algorithm OID {}, expected rsaEncryption",
            format_oid(oid)
        )));
    }

    // rsaEncryption parameters are NULL, though some encoders omit them.
    if !algorithm.is_empty() {
        let params = algorithm.read_tlv(TAG_NULL, "algorithm parameters")?;
        if !params.is_empty() {
            return Err(CallbackError::parse("non-empty NULL algorithm parameters"));
        }
    }
    algorithm.expect_end("AlgorithmIdentifier")
}

/// Strips the DER sign octet from a positive INTEGER.
///
/// A leading zero octet is only legal when the next octet has its high bit set.
fn unsigned_magnitude(integer: &[u8], what: &str) -> Result<Vec<u8>> {
    match integer {
        [] => Err(CallbackError::parse(format!("empty {what}"))),
        [0x00, next, ..] if next & 0x80 == 0 => {
            Err(CallbackError::parse(format!("non-minimal INTEGER encoding of {what}")))
        },
        [0x00, rest @ ..] if !rest.is_empty() => Ok(rest.to_vec()),
        [first, ..] if first & 0x80 != 0 => {
            Err(CallbackError::parse(format!("negative {what}")))
        },
        _ => Ok(integer.to_vec()),
    }
}

/// Renders an encoded OID in dotted form for error messages.
fn format_oid(oid: &[u8]) -> String {
    let Some((&first, rest)) = oid.split_first() else {
        return "<empty>".to_owned();
    };

    let mut arcs = vec![u64::from(first / 40), u64::from(first % 40)];
    let mut value: u64 = 0;
    for &byte in rest {
        value = (value << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            arcs.push(value);
            value = 0;
        }
    }

    arcs.iter().map(u64::to_string).collect::<Vec<_>>().join(".")
}

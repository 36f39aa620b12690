//! Binary cell bodies for the introduction and rendezvous handshakes
//!
//! All multibyte integers are big-endian. Parsing is strict: truncated
//! input yields `HsError::Truncated`, out-of-range tags yield
//! `HsError::InvalidCell`, and every accepted byte string re-encodes to
//! itself byte-for-byte. Encoding refuses internally inconsistent objects
//! (declared lengths that do not match the actual field lengths).
//!
//! The ESTABLISH_INTRO parser additionally records the two regions the
//! crypto covers: the MAC protects everything before `handshake_mac`, the
//! signature everything before `sig`. Verifiers re-MAC and re-check the
//! exact byte range that was read.

use crate::error::{HsError, Result};

/// Length of a rendezvous cookie.
pub const REND_COOKIE_LEN: usize = 20;

/// Length of the rendezvous handshake info: `SERVER_PK || AUTH_MAC`.
pub const HANDSHAKE_INFO_LEN: usize = 64;

/// Length of the ESTABLISH_INTRO handshake MAC.
pub const HANDSHAKE_MAC_LEN: usize = 32;

/// Length of the legacy key id field at the front of INTRODUCE1/2.
const LEGACY_KEY_ID_LEN: usize = 20;

// ===== bounds-checked cursor =====

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(HsError::Truncated {
                needed: n - self.remaining(),
            });
        }
        Ok(())
    }

    fn get_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn get_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn expect_exhausted(&self, what: &str) -> Result<()> {
        if self.remaining() != 0 {
            return Err(HsError::InvalidCell(format!(
                "{}: {} trailing byte(s)",
                what,
                self.remaining()
            )));
        }
        Ok(())
    }
}

// ===== cell extensions =====

/// One extension entry of the shared `N_EXTENSIONS` framing.
///
/// Unknown extension types are carried opaquely so a cell round-trips even
/// when a newer peer added fields we do not understand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellExtension {
    pub ext_type: u8,
    pub data: Vec<u8>,
}

fn parse_extensions(cur: &mut Cursor<'_>) -> Result<Vec<CellExtension>> {
    let count = cur.get_u8()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ext_type = cur.get_u8()?;
        let len = cur.get_u8()? as usize;
        let data = cur.take(len)?.to_vec();
        out.push(CellExtension { ext_type, data });
    }
    Ok(out)
}

fn encode_extensions(buf: &mut Vec<u8>, exts: &[CellExtension]) -> Result<()> {
    if exts.len() > u8::MAX as usize {
        return Err(HsError::InconsistentCell("too many extensions".into()));
    }
    buf.push(exts.len() as u8);
    for ext in exts {
        if ext.data.len() > u8::MAX as usize {
            return Err(HsError::InconsistentCell(format!(
                "extension {} body too long",
                ext.ext_type
            )));
        }
        buf.push(ext.ext_type);
        buf.push(ext.data.len() as u8);
        buf.extend_from_slice(&ext.data);
    }
    Ok(())
}

fn extensions_encoded_len(exts: &[CellExtension]) -> usize {
    1 + exts.iter().map(|e| 2 + e.data.len()).sum::<usize>()
}

// ===== auth key type =====

/// Tag for the kind of introduction-point authentication key in a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthKeyType {
    /// RSA-1024, hashed (legacy v2)
    Legacy0 = 0,
    /// RSA-1024 (legacy v2)
    Legacy1 = 1,
    /// Ed25519 (v3)
    Ed25519 = 2,
}

impl AuthKeyType {
    /// Parse the tag from a byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AuthKeyType::Legacy0),
            1 => Some(AuthKeyType::Legacy1),
            2 => Some(AuthKeyType::Ed25519),
            _ => None,
        }
    }
}

// ===== ESTABLISH_INTRO =====

/// Parsed ESTABLISH_INTRO cell body.
///
/// `auth_key_len` and `sig_len` mirror the wire; they must match the
/// actual vector lengths or encoding is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishIntro {
    pub auth_key_type: AuthKeyType,
    pub auth_key_len: u16,
    pub auth_key: Vec<u8>,
    pub extensions: Vec<CellExtension>,
    pub handshake_mac: [u8; HANDSHAKE_MAC_LEN],
    pub sig_len: u16,
    pub sig: Vec<u8>,
    /// Byte length of the MAC-covered prefix, as read or as it will encode.
    mac_covered_len: usize,
    /// Byte length of the signature-covered prefix.
    sig_covered_len: usize,
}

impl EstablishIntro {
    /// Assemble a cell from fields; the covered-region lengths are derived.
    pub fn new(
        auth_key_type: AuthKeyType,
        auth_key: Vec<u8>,
        extensions: Vec<CellExtension>,
        handshake_mac: [u8; HANDSHAKE_MAC_LEN],
        sig: Vec<u8>,
    ) -> Self {
        let mac_covered_len = 1 + 2 + auth_key.len() + extensions_encoded_len(&extensions);
        let sig_covered_len = mac_covered_len + HANDSHAKE_MAC_LEN + 2;
        Self {
            auth_key_type,
            auth_key_len: auth_key.len() as u16,
            auth_key,
            extensions,
            handshake_mac,
            sig_len: sig.len() as u16,
            sig,
            mac_covered_len,
            sig_covered_len,
        }
    }

    /// Parse a cell body, recording the MAC- and signature-covered spans.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);

        let type_byte = cur.get_u8()?;
        let auth_key_type = AuthKeyType::from_u8(type_byte)
            .ok_or_else(|| HsError::InvalidCell(format!("auth_key_type {}", type_byte)))?;
        let auth_key_len = cur.get_u16()?;
        let auth_key = cur.take(auth_key_len as usize)?.to_vec();
        let extensions = parse_extensions(&mut cur)?;
        let mac_covered_len = cur.position();
        let handshake_mac = cur.take_array::<HANDSHAKE_MAC_LEN>()?;
        let sig_len = cur.get_u16()?;
        let sig_covered_len = cur.position();
        let sig = cur.take(sig_len as usize)?.to_vec();
        cur.expect_exhausted("ESTABLISH_INTRO")?;

        Ok(Self {
            auth_key_type,
            auth_key_len,
            auth_key,
            extensions,
            handshake_mac,
            sig_len,
            sig,
            mac_covered_len,
            sig_covered_len,
        })
    }

    fn check(&self) -> Result<()> {
        if self.auth_key.len() != self.auth_key_len as usize {
            return Err(HsError::InconsistentCell(
                "auth_key_len does not match auth_key".into(),
            ));
        }
        if self.sig.len() != self.sig_len as usize {
            return Err(HsError::InconsistentCell("sig_len does not match sig".into()));
        }
        Ok(())
    }

    /// Encode to bytes; byte-identical to the input for parsed cells.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.check()?;
        let mut buf = Vec::with_capacity(self.sig_covered_len + self.sig.len());
        buf.push(self.auth_key_type as u8);
        buf.extend_from_slice(&self.auth_key_len.to_be_bytes());
        buf.extend_from_slice(&self.auth_key);
        encode_extensions(&mut buf, &self.extensions)?;
        buf.extend_from_slice(&self.handshake_mac);
        buf.extend_from_slice(&self.sig_len.to_be_bytes());
        buf.extend_from_slice(&self.sig);
        Ok(buf)
    }

    /// Bytes covered by the handshake MAC: everything before `handshake_mac`.
    pub fn mac_covered<'a>(&self, raw: &'a [u8]) -> Result<&'a [u8]> {
        raw.get(..self.mac_covered_len)
            .ok_or_else(|| HsError::Internal("mac span outside raw cell".into()))
    }

    /// Bytes covered by the signature: everything before `sig`.
    pub fn sig_covered<'a>(&self, raw: &'a [u8]) -> Result<&'a [u8]> {
        raw.get(..self.sig_covered_len)
            .ok_or_else(|| HsError::Internal("sig span outside raw cell".into()))
    }
}

// ===== INTRO_ESTABLISHED =====

/// INTRO_ESTABLISHED cell body: extensions only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IntroEstablished {
    pub extensions: Vec<CellExtension>,
}

impl IntroEstablished {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let extensions = parse_extensions(&mut cur)?;
        cur.expect_exhausted("INTRO_ESTABLISHED")?;
        Ok(Self { extensions })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(extensions_encoded_len(&self.extensions));
        encode_extensions(&mut buf, &self.extensions)?;
        Ok(buf)
    }
}

// ===== INTRODUCE1 / INTRODUCE2 =====

/// INTRODUCE1 (and INTRODUCE2, which shares the format) cell body.
///
/// For v3 the legacy key id is all-zero; a non-zero value marks a legacy
/// (v2) introduction which the v3 handshake paths reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduce1 {
    pub legacy_key_id: [u8; LEGACY_KEY_ID_LEN],
    pub auth_key_type: AuthKeyType,
    pub auth_key_len: u16,
    pub auth_key: Vec<u8>,
    pub extensions: Vec<CellExtension>,
    /// `CLIENT_PK || ciphertext || MAC`, opaque at this layer.
    pub encrypted: Vec<u8>,
}

impl Introduce1 {
    /// Assemble a v3 cell (zero legacy key id) from fields.
    pub fn new_v3(auth_key: Vec<u8>, extensions: Vec<CellExtension>, encrypted: Vec<u8>) -> Self {
        Self {
            legacy_key_id: [0u8; LEGACY_KEY_ID_LEN],
            auth_key_type: AuthKeyType::Ed25519,
            auth_key_len: auth_key.len() as u16,
            auth_key,
            extensions,
            encrypted,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let legacy_key_id = cur.take_array::<LEGACY_KEY_ID_LEN>()?;
        let type_byte = cur.get_u8()?;
        let auth_key_type = AuthKeyType::from_u8(type_byte)
            .ok_or_else(|| HsError::InvalidCell(format!("auth_key_type {}", type_byte)))?;
        let auth_key_len = cur.get_u16()?;
        let auth_key = cur.take(auth_key_len as usize)?.to_vec();
        let extensions = parse_extensions(&mut cur)?;
        let encrypted = cur.take(cur.remaining())?.to_vec();
        Ok(Self {
            legacy_key_id,
            auth_key_type,
            auth_key_len,
            auth_key,
            extensions,
            encrypted,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.auth_key.len() != self.auth_key_len as usize {
            return Err(HsError::InconsistentCell(
                "auth_key_len does not match auth_key".into(),
            ));
        }
        let mut buf = Vec::with_capacity(
            LEGACY_KEY_ID_LEN
                + 3
                + self.auth_key.len()
                + extensions_encoded_len(&self.extensions)
                + self.encrypted.len(),
        );
        buf.extend_from_slice(&self.legacy_key_id);
        buf.push(self.auth_key_type as u8);
        buf.extend_from_slice(&self.auth_key_len.to_be_bytes());
        buf.extend_from_slice(&self.auth_key);
        encode_extensions(&mut buf, &self.extensions)?;
        buf.extend_from_slice(&self.encrypted);
        Ok(buf)
    }

    /// True when the legacy key id field is non-zero (a v2 cell).
    pub fn is_legacy(&self) -> bool {
        self.legacy_key_id.iter().any(|&b| b != 0)
    }
}

// ===== INTRODUCE_ACK =====

/// Status codes an intro point can answer an INTRODUCE1 with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntroAckStatus {
    /// The INTRODUCE1 was relayed to the service.
    Success,
    /// The intro point refused to relay.
    Failure,
    /// The cell was malformed.
    BadFormat,
    /// The intro point does not recognize the auth key.
    CantRelay,
    /// Unrecognized status; logged and ignored by the client.
    Unknown(u16),
}

impl IntroAckStatus {
    pub fn from_u16(v: u16) -> Self {
        match v {
            0 => IntroAckStatus::Success,
            1 => IntroAckStatus::Failure,
            2 => IntroAckStatus::BadFormat,
            3 => IntroAckStatus::CantRelay,
            other => IntroAckStatus::Unknown(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            IntroAckStatus::Success => 0,
            IntroAckStatus::Failure => 1,
            IntroAckStatus::BadFormat => 2,
            IntroAckStatus::CantRelay => 3,
            IntroAckStatus::Unknown(v) => *v,
        }
    }
}

/// INTRODUCE_ACK cell body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroduceAck {
    pub status: IntroAckStatus,
    pub extensions: Vec<CellExtension>,
}

impl IntroduceAck {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let status = IntroAckStatus::from_u16(cur.get_u16()?);
        let extensions = parse_extensions(&mut cur)?;
        cur.expect_exhausted("INTRODUCE_ACK")?;
        Ok(Self { status, extensions })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(2 + extensions_encoded_len(&self.extensions));
        buf.extend_from_slice(&self.status.as_u16().to_be_bytes());
        encode_extensions(&mut buf, &self.extensions)?;
        Ok(buf)
    }
}

// ===== rendezvous cells =====

/// ESTABLISH_RENDEZVOUS cell body: the bare 20-byte cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishRendezvous {
    pub cookie: [u8; REND_COOKIE_LEN],
}

impl EstablishRendezvous {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let cookie = cur.take_array::<REND_COOKIE_LEN>()?;
        cur.expect_exhausted("ESTABLISH_RENDEZVOUS")?;
        Ok(Self { cookie })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.cookie.to_vec()
    }
}

/// RENDEZVOUS_ESTABLISHED cell body: empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RendezvousEstablished;

impl RendezvousEstablished {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !data.is_empty() {
            return Err(HsError::InvalidCell(format!(
                "RENDEZVOUS_ESTABLISHED: {} unexpected byte(s)",
                data.len()
            )));
        }
        Ok(Self)
    }

    pub fn encode(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// RENDEZVOUS1 cell body: cookie plus the service's handshake info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous1 {
    pub cookie: [u8; REND_COOKIE_LEN],
    pub handshake_info: [u8; HANDSHAKE_INFO_LEN],
}

impl Rendezvous1 {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let cookie = cur.take_array::<REND_COOKIE_LEN>()?;
        let handshake_info = cur.take_array::<HANDSHAKE_INFO_LEN>()?;
        cur.expect_exhausted("RENDEZVOUS1")?;
        Ok(Self {
            cookie,
            handshake_info,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REND_COOKIE_LEN + HANDSHAKE_INFO_LEN);
        buf.extend_from_slice(&self.cookie);
        buf.extend_from_slice(&self.handshake_info);
        buf
    }
}

/// RENDEZVOUS2 cell body: the handshake info forwarded to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous2 {
    pub handshake_info: [u8; HANDSHAKE_INFO_LEN],
}

impl Rendezvous2 {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let handshake_info = cur.take_array::<HANDSHAKE_INFO_LEN>()?;
        cur.expect_exhausted("RENDEZVOUS2")?;
        Ok(Self { handshake_info })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.handshake_info.to_vec()
    }
}

// ===== link specifiers =====

/// A way to reach a relay, carried inside the INTRODUCE1 plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpecifier {
    /// TLS-over-TCP, IPv4 (type 0)
    Ipv4 { addr: [u8; 4], port: u16 },
    /// Legacy RSA identity digest (type 1)
    LegacyId([u8; 20]),
    /// Ed25519 identity (type 2)
    Ed25519Id([u8; 32]),
    /// TLS-over-TCP, IPv6 (type 3)
    Ipv6 { addr: [u8; 16], port: u16 },
    /// Unrecognized; preserved opaquely for round-trip.
    Unknown { ls_type: u8, data: Vec<u8> },
}

impl LinkSpecifier {
    fn parse_one(cur: &mut Cursor<'_>) -> Result<Self> {
        let ls_type = cur.get_u8()?;
        let ls_len = cur.get_u8()? as usize;
        let data = cur.take(ls_len)?;
        let check_len = |want: usize| -> Result<()> {
            if ls_len != want {
                return Err(HsError::InvalidCell(format!(
                    "link specifier type {} has length {}, want {}",
                    ls_type, ls_len, want
                )));
            }
            Ok(())
        };
        match ls_type {
            0 => {
                check_len(6)?;
                let mut addr = [0u8; 4];
                addr.copy_from_slice(&data[..4]);
                let port = u16::from_be_bytes([data[4], data[5]]);
                Ok(LinkSpecifier::Ipv4 { addr, port })
            }
            1 => {
                check_len(20)?;
                let mut id = [0u8; 20];
                id.copy_from_slice(data);
                Ok(LinkSpecifier::LegacyId(id))
            }
            2 => {
                check_len(32)?;
                let mut id = [0u8; 32];
                id.copy_from_slice(data);
                Ok(LinkSpecifier::Ed25519Id(id))
            }
            3 => {
                check_len(18)?;
                let mut addr = [0u8; 16];
                addr.copy_from_slice(&data[..16]);
                let port = u16::from_be_bytes([data[16], data[17]]);
                Ok(LinkSpecifier::Ipv6 { addr, port })
            }
            _ => Ok(LinkSpecifier::Unknown {
                ls_type,
                data: data.to_vec(),
            }),
        }
    }

    fn encode_one(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            LinkSpecifier::Ipv4 { addr, port } => {
                buf.push(0);
                buf.push(6);
                buf.extend_from_slice(addr);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpecifier::LegacyId(id) => {
                buf.push(1);
                buf.push(20);
                buf.extend_from_slice(id);
            }
            LinkSpecifier::Ed25519Id(id) => {
                buf.push(2);
                buf.push(32);
                buf.extend_from_slice(id);
            }
            LinkSpecifier::Ipv6 { addr, port } => {
                buf.push(3);
                buf.push(18);
                buf.extend_from_slice(addr);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpecifier::Unknown { ls_type, data } => {
                if data.len() > u8::MAX as usize {
                    return Err(HsError::InconsistentCell(
                        "link specifier body too long".into(),
                    ));
                }
                buf.push(*ls_type);
                buf.push(data.len() as u8);
                buf.extend_from_slice(data);
            }
        }
        Ok(())
    }
}

// ===== INTRODUCE1 plaintext =====

/// Onion key tag inside the INTRODUCE1 plaintext; only ntor is defined.
const ONION_KEY_TYPE_NTOR: u8 = 1;

/// Decrypted section of an INTRODUCE1/2 cell.
///
/// Trailing padding is tolerated when parsing and not regenerated when
/// encoding; the encrypting layer pads the final cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduce1Payload {
    pub rendezvous_cookie: [u8; REND_COOKIE_LEN],
    pub extensions: Vec<CellExtension>,
    /// The client's rendezvous-point ntor onion key (X25519).
    pub onion_key: [u8; 32],
    pub link_specifiers: Vec<LinkSpecifier>,
}

impl Introduce1Payload {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let rendezvous_cookie = cur.take_array::<REND_COOKIE_LEN>()?;
        let extensions = parse_extensions(&mut cur)?;
        let onion_key_type = cur.get_u8()?;
        if onion_key_type != ONION_KEY_TYPE_NTOR {
            return Err(HsError::InvalidCell(format!(
                "onion key type {}",
                onion_key_type
            )));
        }
        let onion_key_len = cur.get_u16()?;
        if onion_key_len != 32 {
            return Err(HsError::InvalidCell(format!(
                "ntor onion key length {}",
                onion_key_len
            )));
        }
        let onion_key = cur.take_array::<32>()?;
        let nspec = cur.get_u8()?;
        let mut link_specifiers = Vec::with_capacity(nspec as usize);
        for _ in 0..nspec {
            link_specifiers.push(LinkSpecifier::parse_one(&mut cur)?);
        }
        // Whatever remains is padding.
        Ok(Self {
            rendezvous_cookie,
            extensions,
            onion_key,
            link_specifiers,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.link_specifiers.len() > u8::MAX as usize {
            return Err(HsError::InconsistentCell("too many link specifiers".into()));
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.rendezvous_cookie);
        encode_extensions(&mut buf, &self.extensions)?;
        buf.push(ONION_KEY_TYPE_NTOR);
        buf.extend_from_slice(&32u16.to_be_bytes());
        buf.extend_from_slice(&self.onion_key);
        buf.push(self.link_specifiers.len() as u8);
        for spec in &self.link_specifiers {
            spec.encode_one(&mut buf)?;
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_establish_intro() -> EstablishIntro {
        EstablishIntro::new(
            AuthKeyType::Ed25519,
            vec![0x42; 32],
            vec![CellExtension {
                ext_type: 7,
                data: vec![1, 2, 3],
            }],
            [0xaa; HANDSHAKE_MAC_LEN],
            vec![0xbb; 64],
        )
    }

    #[test]
    fn test_establish_intro_round_trip() {
        let cell = sample_establish_intro();
        let bytes = cell.encode().unwrap();
        let parsed = EstablishIntro::parse(&bytes).unwrap();
        assert_eq!(parsed, cell);
        assert_eq!(parsed.encode().unwrap(), bytes);
    }

    #[test]
    fn test_establish_intro_spans() {
        let cell = sample_establish_intro();
        let bytes = cell.encode().unwrap();
        let parsed = EstablishIntro::parse(&bytes).unwrap();

        let mac_covered = parsed.mac_covered(&bytes).unwrap();
        // type(1) + len(2) + key(32) + ext framing(1 + 2 + 3)
        assert_eq!(mac_covered.len(), 1 + 2 + 32 + 1 + 2 + 3);
        let sig_covered = parsed.sig_covered(&bytes).unwrap();
        assert_eq!(sig_covered.len(), mac_covered.len() + HANDSHAKE_MAC_LEN + 2);
        // Signature is the final field.
        assert_eq!(sig_covered.len() + parsed.sig.len(), bytes.len());
    }

    #[test]
    fn test_establish_intro_truncated() {
        let bytes = sample_establish_intro().encode().unwrap();
        for cut in [0, 1, 3, 10, bytes.len() - 1] {
            let err = EstablishIntro::parse(&bytes[..cut]).unwrap_err();
            assert!(
                matches!(err, HsError::Truncated { .. }),
                "cut at {} gave {:?}",
                cut,
                err
            );
        }
    }

    #[test]
    fn test_establish_intro_bad_tag() {
        let mut bytes = sample_establish_intro().encode().unwrap();
        bytes[0] = 3;
        assert!(matches!(
            EstablishIntro::parse(&bytes).unwrap_err(),
            HsError::InvalidCell(_)
        ));
    }

    #[test]
    fn test_establish_intro_refuses_inconsistent_encode() {
        let mut cell = sample_establish_intro();
        cell.auth_key_len = 31;
        assert!(matches!(
            cell.encode().unwrap_err(),
            HsError::InconsistentCell(_)
        ));
    }

    #[test]
    fn test_intro_established_round_trip() {
        let cell = IntroEstablished {
            extensions: vec![CellExtension {
                ext_type: 1,
                data: vec![9],
            }],
        };
        let bytes = cell.encode().unwrap();
        let parsed = IntroEstablished::parse(&bytes).unwrap();
        assert_eq!(parsed, cell);
        assert_eq!(parsed.encode().unwrap(), bytes);

        // Empty body is one zero extension-count byte.
        let empty = IntroEstablished::default().encode().unwrap();
        assert_eq!(empty, vec![0]);
    }

    #[test]
    fn test_introduce1_round_trip_and_legacy_flag() {
        let cell = Introduce1::new_v3(vec![0x11; 32], Vec::new(), vec![0x22; 100]);
        assert!(!cell.is_legacy());
        let bytes = cell.encode().unwrap();
        let parsed = Introduce1::parse(&bytes).unwrap();
        assert_eq!(parsed, cell);
        assert_eq!(parsed.encode().unwrap(), bytes);

        let mut legacy = cell.clone();
        legacy.legacy_key_id[3] = 1;
        assert!(legacy.is_legacy());
    }

    #[test]
    fn test_introduce_ack_statuses() {
        for raw in [0u16, 1, 2, 3, 700] {
            let cell = IntroduceAck {
                status: IntroAckStatus::from_u16(raw),
                extensions: Vec::new(),
            };
            let bytes = cell.encode().unwrap();
            let parsed = IntroduceAck::parse(&bytes).unwrap();
            assert_eq!(parsed.status.as_u16(), raw);
        }
        assert_eq!(IntroAckStatus::from_u16(4), IntroAckStatus::Unknown(4));
    }

    #[test]
    fn test_rendezvous_cells_strict_lengths() {
        let est = EstablishRendezvous { cookie: [7; 20] };
        assert_eq!(EstablishRendezvous::parse(&est.encode()).unwrap(), est);
        assert!(EstablishRendezvous::parse(&[0u8; 19]).is_err());
        assert!(EstablishRendezvous::parse(&[0u8; 21]).is_err());

        let r1 = Rendezvous1 {
            cookie: [7; 20],
            handshake_info: [9; 64],
        };
        assert_eq!(Rendezvous1::parse(&r1.encode()).unwrap(), r1);

        let r2 = Rendezvous2 {
            handshake_info: [9; 64],
        };
        assert_eq!(Rendezvous2::parse(&r2.encode()).unwrap(), r2);
        assert!(Rendezvous2::parse(&[0u8; 63]).is_err());

        assert!(RendezvousEstablished::parse(&[]).is_ok());
        assert!(RendezvousEstablished::parse(&[0]).is_err());
    }

    #[test]
    fn test_introduce_payload_round_trip_with_padding() {
        let payload = Introduce1Payload {
            rendezvous_cookie: [3; 20],
            extensions: Vec::new(),
            onion_key: [4; 32],
            link_specifiers: vec![
                LinkSpecifier::Ipv4 {
                    addr: [10, 0, 0, 1],
                    port: 9001,
                },
                LinkSpecifier::LegacyId([5; 20]),
                LinkSpecifier::Ed25519Id([6; 32]),
            ],
        };
        let mut bytes = payload.encode().unwrap();
        let parsed = Introduce1Payload::parse(&bytes).unwrap();
        assert_eq!(parsed, payload);

        // Trailing padding is accepted and ignored.
        bytes.extend_from_slice(&[0u8; 57]);
        let padded = Introduce1Payload::parse(&bytes).unwrap();
        assert_eq!(padded, payload);
    }

    #[test]
    fn test_link_specifier_length_enforcement() {
        // type 2 (ed25519) with a 31-byte body
        let mut buf = vec![0u8; 0];
        buf.extend_from_slice(&[3; 20]); // cookie
        buf.push(0); // no extensions
        buf.push(1); // ntor
        buf.extend_from_slice(&32u16.to_be_bytes());
        buf.extend_from_slice(&[4; 32]);
        buf.push(1); // one specifier
        buf.push(2);
        buf.push(31);
        buf.extend_from_slice(&[6; 31]);
        assert!(matches!(
            Introduce1Payload::parse(&buf).unwrap_err(),
            HsError::InvalidCell(_)
        ));
    }

    #[test]
    fn test_unknown_link_specifier_preserved() {
        let payload = Introduce1Payload {
            rendezvous_cookie: [1; 20],
            extensions: Vec::new(),
            onion_key: [2; 32],
            link_specifiers: vec![LinkSpecifier::Unknown {
                ls_type: 200,
                data: vec![1, 2, 3, 4],
            }],
        };
        let bytes = payload.encode().unwrap();
        assert_eq!(Introduce1Payload::parse(&bytes).unwrap(), payload);
    }
}

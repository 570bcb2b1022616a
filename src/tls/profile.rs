//! Frozen ClientHello profile.
//!
//! The tunnel's TLS client presents a fixed, curl-like hello: cipher order,
//! curve list, extension order and padded length are all constants. Any
//! deviation changes the wire fingerprint, so the tables below are treated
//! as a wire format, not as tunables.

use bytes::{BufMut, BytesMut};

/// Cipher suites in wire order. The duplicate `0x009d` is part of the
/// profile and must not be deduplicated.
pub const CIPHER_SUITES: [u16; 31] = [
    0x1302, 0x1303, 0x1301, 0xc02c, 0xc030, 0x009f, 0xcca9, 0xcca8, //
    0xccaa, 0xc02b, 0xc02f, 0x009e, 0xc024, 0xc028, 0x006b, 0xc023, //
    0xc027, 0x0067, 0xc014, 0x0039, 0xc009, 0xc013, 0x0033, 0x009d, //
    0x009d, 0x009c, 0x003d, 0x003c, 0x0035, 0x002f, 0x00ff,
];

pub const COMPRESSION_METHODS: [u8; 1] = [0];

pub const EC_POINT_FORMATS: [u8; 3] = [0, 1, 2];

/// x25519, secp256r1, x448, secp521r1, secp384r1, then the ffdhe range.
pub const SUPPORTED_GROUPS: [u16; 10] = [
    0x001d, 0x0017, 0x001e, 0x0019, 0x0018, 0x0100, 0x0101, 0x0102, 0x0103, 0x0104,
];

pub const ALPN_PROTOCOLS: [&str; 2] = ["h2", "http/1.1"];

pub const SIGNATURE_ALGORITHMS: [u16; 20] = [
    0x0403, 0x0503, 0x0603, 0x0807, 0x0808, 0x0809, 0x080a, 0x080b, //
    0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601, 0x0303, 0x0301, //
    0x0302, 0x0402, 0x0502, 0x0602,
];

/// TLS 1.3 first, then TLS 1.2.
pub const SUPPORTED_VERSIONS: [u16; 2] = [0x0304, 0x0303];

/// psk_dhe_ke only.
pub const PSK_MODES: [u8; 1] = [1];

/// The padding extension carries exactly this many zero bytes.
pub const PADDING_LEN: usize = 174;

/// Extension ids in emission order.
pub const EXTENSION_ORDER: [u16; 12] = [
    EXT_SERVER_NAME,
    EXT_EC_POINT_FORMATS,
    EXT_SUPPORTED_GROUPS,
    EXT_ALPN,
    EXT_PLACEHOLDER_22,
    EXT_EXTENDED_MASTER_SECRET,
    EXT_PLACEHOLDER_49,
    EXT_SIGNATURE_ALGORITHMS,
    EXT_SUPPORTED_VERSIONS,
    EXT_PSK_KEY_EXCHANGE_MODES,
    EXT_KEY_SHARE,
    EXT_PADDING,
];

pub const EXT_SERVER_NAME: u16 = 0;
pub const EXT_SUPPORTED_GROUPS: u16 = 10;
pub const EXT_EC_POINT_FORMATS: u16 = 11;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
pub const EXT_ALPN: u16 = 16;
pub const EXT_PADDING: u16 = 21;
pub const EXT_PLACEHOLDER_22: u16 = 22;
pub const EXT_EXTENDED_MASTER_SECRET: u16 = 23;
pub const EXT_SUPPORTED_VERSIONS: u16 = 43;
pub const EXT_PSK_KEY_EXCHANGE_MODES: u16 = 45;
pub const EXT_PLACEHOLDER_49: u16 = 49;
pub const EXT_KEY_SHARE: u16 = 51;

const GROUP_X25519: u16 = 0x001d;
const LEGACY_VERSION: u16 = 0x0303;

/// Inputs that vary per connection; everything else is fixed by the profile.
#[derive(Debug, Clone)]
pub struct HelloInputs<'a> {
    pub server_name: &'a str,
    pub random: [u8; 32],
    pub session_id: &'a [u8],
    pub x25519_key_share: [u8; 32],
}

/// Encode the full ClientHello TLS record for this profile.
///
/// Deterministic: two calls with identical inputs produce identical bytes.
pub fn encode_client_hello(inputs: &HelloInputs<'_>) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(512);

    body.put_u16(LEGACY_VERSION);
    body.put_slice(&inputs.random);
    body.put_u8(inputs.session_id.len() as u8);
    body.put_slice(inputs.session_id);

    body.put_u16((CIPHER_SUITES.len() * 2) as u16);
    for suite in CIPHER_SUITES {
        body.put_u16(suite);
    }

    body.put_u8(COMPRESSION_METHODS.len() as u8);
    body.put_slice(&COMPRESSION_METHODS);

    let extensions = encode_extensions(inputs);
    body.put_u16(extensions.len() as u16);
    body.put_slice(&extensions);

    let mut record = BytesMut::with_capacity(body.len() + 9);
    record.put_u8(0x16); // handshake
    record.put_u16(0x0301); // record-layer version pinned to TLS 1.0
    record.put_u16((body.len() + 4) as u16);
    record.put_u8(0x01); // client_hello
    record.put_u8(0);
    record.put_u16(body.len() as u16); // u24 length, high byte always 0 here
    record.put_slice(&body);
    record.to_vec()
}

fn encode_extensions(inputs: &HelloInputs<'_>) -> BytesMut {
    let mut out = BytesMut::with_capacity(512);

    // server_name
    {
        let name = inputs.server_name.as_bytes();
        let mut data = BytesMut::with_capacity(name.len() + 5);
        data.put_u16((name.len() + 3) as u16); // server_name_list
        data.put_u8(0); // host_name
        data.put_u16(name.len() as u16);
        data.put_slice(name);
        put_extension(&mut out, EXT_SERVER_NAME, &data);
    }

    // ec_point_formats
    {
        let mut data = BytesMut::with_capacity(4);
        data.put_u8(EC_POINT_FORMATS.len() as u8);
        data.put_slice(&EC_POINT_FORMATS);
        put_extension(&mut out, EXT_EC_POINT_FORMATS, &data);
    }

    // supported_groups
    {
        let mut data = BytesMut::with_capacity(SUPPORTED_GROUPS.len() * 2 + 2);
        data.put_u16((SUPPORTED_GROUPS.len() * 2) as u16);
        for group in SUPPORTED_GROUPS {
            data.put_u16(group);
        }
        put_extension(&mut out, EXT_SUPPORTED_GROUPS, &data);
    }

    // application_layer_protocol_negotiation
    {
        let mut list = BytesMut::new();
        for proto in ALPN_PROTOCOLS {
            list.put_u8(proto.len() as u8);
            list.put_slice(proto.as_bytes());
        }
        let mut data = BytesMut::with_capacity(list.len() + 2);
        data.put_u16(list.len() as u16);
        data.put_slice(&list);
        put_extension(&mut out, EXT_ALPN, &data);
    }

    put_extension(&mut out, EXT_PLACEHOLDER_22, &[]);
    put_extension(&mut out, EXT_EXTENDED_MASTER_SECRET, &[]);
    put_extension(&mut out, EXT_PLACEHOLDER_49, &[]);

    // signature_algorithms
    {
        let mut data = BytesMut::with_capacity(SIGNATURE_ALGORITHMS.len() * 2 + 2);
        data.put_u16((SIGNATURE_ALGORITHMS.len() * 2) as u16);
        for alg in SIGNATURE_ALGORITHMS {
            data.put_u16(alg);
        }
        put_extension(&mut out, EXT_SIGNATURE_ALGORITHMS, &data);
    }

    // supported_versions
    {
        let mut data = BytesMut::with_capacity(SUPPORTED_VERSIONS.len() * 2 + 1);
        data.put_u8((SUPPORTED_VERSIONS.len() * 2) as u8);
        for version in SUPPORTED_VERSIONS {
            data.put_u16(version);
        }
        put_extension(&mut out, EXT_SUPPORTED_VERSIONS, &data);
    }

    // psk_key_exchange_modes
    {
        let mut data = BytesMut::with_capacity(2);
        data.put_u8(PSK_MODES.len() as u8);
        data.put_slice(&PSK_MODES);
        put_extension(&mut out, EXT_PSK_KEY_EXCHANGE_MODES, &data);
    }

    // key_share: x25519 only
    {
        let mut data = BytesMut::with_capacity(38);
        data.put_u16(36); // client_shares length
        data.put_u16(GROUP_X25519);
        data.put_u16(32);
        data.put_slice(&inputs.x25519_key_share);
        put_extension(&mut out, EXT_KEY_SHARE, &data);
    }

    // padding: fixed-size block of zeros
    put_extension(&mut out, EXT_PADDING, &[0u8; PADDING_LEN]);

    out
}

fn put_extension(out: &mut BytesMut, id: u16, data: &[u8]) {
    out.put_u16(id);
    out.put_u16(data.len() as u16);
    out.put_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_inputs() -> HelloInputs<'static> {
        HelloInputs {
            server_name: "localhost",
            random: [0u8; 32],
            session_id: &[],
            x25519_key_share: [0u8; 32],
        }
    }

    /// Minimal walker over the encoded record, used to assert structure.
    struct Parsed {
        cipher_suites: Vec<u16>,
        extensions: Vec<(u16, Vec<u8>)>,
    }

    fn parse(record: &[u8]) -> Parsed {
        assert_eq!(record[0], 0x16, "handshake record");
        assert_eq!(&record[1..3], &[0x03, 0x01], "record version");
        let record_len = u16::from_be_bytes([record[3], record[4]]) as usize;
        assert_eq!(record_len, record.len() - 5, "record length");

        assert_eq!(record[5], 0x01, "client_hello");
        let body_len =
            ((record[6] as usize) << 16) | ((record[7] as usize) << 8) | record[8] as usize;
        assert_eq!(body_len, record.len() - 9, "handshake length");

        let mut at = 9;
        assert_eq!(&record[at..at + 2], &[0x03, 0x03], "legacy version");
        at += 2 + 32; // version + random
        let sid_len = record[at] as usize;
        at += 1 + sid_len;

        let ciphers_len = u16::from_be_bytes([record[at], record[at + 1]]) as usize;
        at += 2;
        let cipher_suites = record[at..at + ciphers_len]
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        at += ciphers_len;

        let comp_len = record[at] as usize;
        assert_eq!(&record[at + 1..at + 1 + comp_len], &COMPRESSION_METHODS);
        at += 1 + comp_len;

        let ext_total = u16::from_be_bytes([record[at], record[at + 1]]) as usize;
        at += 2;
        assert_eq!(ext_total, record.len() - at, "extensions length");

        let mut extensions = Vec::new();
        while at < record.len() {
            let id = u16::from_be_bytes([record[at], record[at + 1]]);
            let len = u16::from_be_bytes([record[at + 2], record[at + 3]]) as usize;
            at += 4;
            extensions.push((id, record[at..at + len].to_vec()));
            at += len;
        }

        Parsed {
            cipher_suites,
            extensions,
        }
    }

    #[test]
    fn hello_is_deterministic() {
        let inputs = fixed_inputs();
        assert_eq!(encode_client_hello(&inputs), encode_client_hello(&inputs));
    }

    #[test]
    fn cipher_suites_match_profile_in_order() {
        let parsed = parse(&encode_client_hello(&fixed_inputs()));
        assert_eq!(parsed.cipher_suites, CIPHER_SUITES);
        // The intentional duplicate survives encoding.
        assert_eq!(
            parsed.cipher_suites.iter().filter(|&&c| c == 0x009d).count(),
            2
        );
    }

    #[test]
    fn extension_order_is_frozen() {
        let parsed = parse(&encode_client_hello(&fixed_inputs()));
        let ids: Vec<u16> = parsed.extensions.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, EXTENSION_ORDER);
    }

    #[test]
    fn sni_carries_the_server_name() {
        let parsed = parse(&encode_client_hello(&fixed_inputs()));
        let (_, sni) = &parsed.extensions[0];
        assert!(sni.ends_with(b"localhost"));
        assert_eq!(sni[2], 0, "host_name type");
    }

    #[test]
    fn padding_extension_is_fixed_length() {
        let parsed = parse(&encode_client_hello(&fixed_inputs()));
        let (id, data) = parsed.extensions.last().unwrap();
        assert_eq!(*id, EXT_PADDING);
        assert_eq!(data.len(), PADDING_LEN);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn placeholder_extensions_are_empty() {
        let parsed = parse(&encode_client_hello(&fixed_inputs()));
        for want in [EXT_PLACEHOLDER_22, EXT_PLACEHOLDER_49, EXT_EXTENDED_MASTER_SECRET] {
            let (_, data) = parsed
                .extensions
                .iter()
                .find(|(id, _)| *id == want)
                .unwrap();
            assert!(data.is_empty());
        }
    }

    #[test]
    fn key_share_is_x25519_only() {
        let parsed = parse(&encode_client_hello(&fixed_inputs()));
        let (_, data) = parsed
            .extensions
            .iter()
            .find(|(id, _)| *id == EXT_KEY_SHARE)
            .unwrap();
        assert_eq!(data.len(), 38);
        assert_eq!(u16::from_be_bytes([data[2], data[3]]), 0x001d);
        assert_eq!(u16::from_be_bytes([data[4], data[5]]), 32);
    }

    #[test]
    fn golden_header_for_localhost() {
        // Regression anchor: the first bytes of the record for fixed inputs.
        let hello = encode_client_hello(&fixed_inputs());
        assert_eq!(&hello[..5], &[0x16, 0x03, 0x01, 0x01, 0xd6]);
        assert_eq!(hello.len(), 0x01d6 + 5);
    }
}

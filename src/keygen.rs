//! TLS keypair generation: a self-signed Ed25519 certificate usable by
//! both the server (keypair) and the client (pinned CA bundle).

use std::fs;

use anyhow::Context;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use tracing::info;

use crate::config::KeygenArgs;
use crate::tls;

/// Certificate validity in days (ten years).
const VALIDITY_DAYS: i64 = 3650;

pub fn run(args: &KeygenArgs) -> anyhow::Result<()> {
    if args.key_out.exists() {
        anyhow::bail!("key file '{}' exists", args.key_out.display());
    }
    if args.cert_out.exists() {
        anyhow::bail!("cert file '{}' exists", args.cert_out.display());
    }

    let mut san: Vec<String> = args.dns_names.clone();
    san.extend(args.ip_addrs.iter().map(|ip| ip.to_string()));

    let mut params = CertificateParams::new(san).context("invalid subject alternative name")?;

    // Randomized subject so two generated certificates never share one.
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, rand_string(16));
    dn.push(DnType::OrganizationName, rand_string(16));
    dn.push(DnType::OrganizationalUnitName, rand_string(16));
    params.distinguished_name = dn;

    params.serial_number = Some(SerialNumber::from(rand_bytes(16)));
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(VALIDITY_DAYS);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;
    let cert = params.self_signed(&key_pair)?;

    if let Some(parent) = args.key_out.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if let Some(parent) = args.cert_out.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    fs::write(&args.key_out, key_pair.serialize_pem())?;
    set_mode(&args.key_out, 0o600)?;
    info!("wrote key to: {}", args.key_out.display());

    fs::write(&args.cert_out, cert.pem())?;
    set_mode(&args.cert_out, 0o644)?;
    info!("wrote certificate to: {}", args.cert_out.display());

    let fingerprint = tls::server::cert_sha256_fingerprint(&args.cert_out)?;
    info!(sha256 = %fingerprint, "certificate fingerprint");

    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &std::path::Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

fn rand_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn rand_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes
}

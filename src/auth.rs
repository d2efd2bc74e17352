//! RSA key material for the ADB challenge/response handshake: load a
//! caller-supplied key or generate an ephemeral one, sign the device's
//! challenge, and export the public half in OpenSSH `authorized_keys`
//! format for the "unknown key" retry (§4.2 step 4).

use base64::Engine as _;
use rand::rngs::OsRng;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use std::path::Path;

use crate::error::AdbError;

const RSA_KEY_BITS: usize = 2048;

pub struct AuthKey {
    private: RsaPrivateKey,
}

impl AuthKey {
    /// Generate a fresh, throwaway 2048-bit key for a single connection.
    pub fn generate() -> Result<Self, AdbError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| AdbError::SigningFailed(format!("key generation failed: {e}")))?;
        Ok(Self { private })
    }

    /// Load a caller-supplied key from a PKCS#8 PEM file (e.g. `~/.android/adbkey`).
    pub fn from_pkcs8_pem_file(path: &Path) -> Result<Self, AdbError> {
        let pem = std::fs::read_to_string(path).map_err(AdbError::TransportError)?;
        let private = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| AdbError::SigningFailed(format!("invalid PKCS#8 key: {e}")))?;
        Ok(Self { private })
    }

    /// `RSA-PKCS#1-v1.5-Sign(key, SHA1(token))`, as demanded by AUTH type 2.
    pub fn sign_challenge(&self, token: &[u8]) -> Result<Vec<u8>, AdbError> {
        let digest = Sha1::digest(token);
        let padding = Pkcs1v15Sign::new::<Sha1>();
        self.private
            .sign(padding, &digest)
            .map_err(|e| AdbError::SigningFailed(e.to_string()))
    }

    fn public(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private)
    }

    /// Render the public half as an OpenSSH `authorized_keys` line:
    /// `ssh-rsa <base64-blob> <comment>\n`.
    pub fn to_openssh_authorized_key(&self, comment: &str) -> String {
        let blob = encode_ssh_rsa_blob(&self.public());
        let b64 = base64::engine::general_purpose::STANDARD.encode(blob);
        if comment.is_empty() {
            format!("ssh-rsa {b64}\n")
        } else {
            format!("ssh-rsa {b64} {comment}\n")
        }
    }
}

/// The SSH wire "public key blob" for an RSA key: the three length-prefixed
/// fields `"ssh-rsa"`, `e`, `n`, each as defined by RFC 4251 §5 (strings and
/// mpints). This is the payload that gets base64-encoded into an
/// `authorized_keys` line; it is not itself ADB-specific, just the format
/// the handshake is required to speak.
fn encode_ssh_rsa_blob(pubkey: &RsaPublicKey) -> Vec<u8> {
    let mut out = Vec::new();
    write_ssh_string(&mut out, b"ssh-rsa");
    write_ssh_mpint(&mut out, &pubkey.e().to_bytes_be());
    write_ssh_mpint(&mut out, &pubkey.n().to_bytes_be());
    out
}

fn write_ssh_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// mpint encoding: big-endian, minimal, with a leading zero byte inserted
/// when the high bit of the first byte would otherwise make the value
/// read as negative.
fn write_ssh_mpint(out: &mut Vec<u8>, big_endian: &[u8]) {
    let mut bytes = big_endian;
    while bytes.len() > 1 && bytes[0] == 0 {
        bytes = &bytes[1..];
    }
    if !bytes.is_empty() && bytes[0] & 0x80 != 0 {
        let mut padded = Vec::with_capacity(bytes.len() + 1);
        padded.push(0);
        padded.extend_from_slice(bytes);
        write_ssh_string(out, &padded);
    } else {
        write_ssh_string(out, bytes);
    }
}

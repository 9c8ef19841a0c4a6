/*
 * Copyright (c) 2020-2022, Stalwart Labs Ltd.
 *
 * This file is part of the Stalwart Mesh Server.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 *
 * You can be released from the requirements of the AGPLv3 license by
 * purchasing a commercial license. Please contact licensing@stalw.art
 * for more details.
*/

use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{consts::U12, Aead, KeyInit},
    aes::Aes192,
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
};
use parking_lot::Mutex;
use rand::RngCore;

use crate::error::{Error, Result};

type Aes192Gcm = AesGcm<Aes192, U12>;

pub const ENVELOPE_VERSION: u8 = 1;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Bytes added to a plaintext by the encryption envelope:
/// version byte, nonce and auth tag.
pub const ENCRYPT_OVERHEAD: usize = 1 + NONCE_LEN + TAG_LEN;

enum GossipCipher {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl GossipCipher {
    fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Ok(GossipCipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key).unwrap(),
            ))),
            24 => Ok(GossipCipher::Aes192(Box::new(
                Aes192Gcm::new_from_slice(key).unwrap(),
            ))),
            32 => Ok(GossipCipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key).unwrap(),
            ))),
            len => Err(Error::InvalidKeyLength(len)),
        }
    }

    fn encrypt(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            GossipCipher::Aes128(aes) => aes.encrypt(nonce, plaintext),
            GossipCipher::Aes192(aes) => aes.encrypt(nonce, plaintext),
            GossipCipher::Aes256(aes) => aes.encrypt(nonce, plaintext),
        }
        .map_err(|_| Error::Protocol("AEAD encryption failed".to_string()))
    }

    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            GossipCipher::Aes128(aes) => aes.decrypt(nonce, ciphertext),
            GossipCipher::Aes192(aes) => aes.decrypt(nonce, ciphertext),
            GossipCipher::Aes256(aes) => aes.decrypt(nonce, ciphertext),
        }
        .map_err(|_| Error::DecryptionFailed)
    }
}

struct InstalledKey {
    bytes: Vec<u8>,
    cipher: GossipCipher,
}

/// Ordered key list with the primary key first. Outbound packets are
/// sealed with the primary; inbound packets are opened with each key in
/// order until one validates. Mutations and the optional on-disk file are
/// serialized under a single mutex.
pub struct Keyring {
    keys: Mutex<Vec<InstalledKey>>,
    path: Option<PathBuf>,
}

impl Keyring {
    pub fn new(primary: Vec<u8>, path: Option<PathBuf>) -> Result<Self> {
        let ring = Keyring {
            keys: Mutex::new(Vec::new()),
            path,
        };
        ring.install(primary)?;
        Ok(ring)
    }

    /// Loads a keyring file: a JSON array of base64 keys, primary first.
    /// Any parse error is fatal to startup.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::Configuration(format!(
                "Failed to read keyring file {}: {}",
                path.display(),
                err
            ))
        })?;
        let encoded: Vec<String> = serde_json::from_str(&content).map_err(|err| {
            Error::Configuration(format!(
                "Failed to parse keyring file {}: {}",
                path.display(),
                err
            ))
        })?;
        if encoded.is_empty() {
            return Err(Error::Configuration(format!(
                "Keyring file {} contains no keys",
                path.display()
            )));
        }

        let mut keys = Vec::with_capacity(encoded.len());
        for key in encoded {
            let bytes = base64::decode(&key).map_err(|err| {
                Error::Configuration(format!("Invalid base64 key in keyring file: {}", err))
            })?;
            let cipher = GossipCipher::new(&bytes)?;
            keys.push(InstalledKey { bytes, cipher });
        }

        Ok(Keyring {
            keys: Mutex::new(keys),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn install(&self, key: Vec<u8>) -> Result<()> {
        let cipher = GossipCipher::new(&key)?;
        let mut keys = self.keys.lock();
        if !keys.iter().any(|k| k.bytes == key) {
            keys.push(InstalledKey { bytes: key, cipher });
        }
        self.persist(&keys)
    }

    pub fn use_key(&self, key: &[u8]) -> Result<()> {
        let mut keys = self.keys.lock();
        let pos = keys
            .iter()
            .position(|k| k.bytes == key)
            .ok_or(Error::PrimaryKeyNotFound)?;
        let key = keys.remove(pos);
        keys.insert(0, key);
        self.persist(&keys)
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let mut keys = self.keys.lock();
        let pos = keys
            .iter()
            .position(|k| k.bytes == key)
            .ok_or_else(|| Error::State("Key is not in the keyring".to_string()))?;
        if pos == 0 {
            return Err(Error::State(
                "Removing the primary key is not allowed".to_string(),
            ));
        }
        keys.remove(pos);
        self.persist(&keys)
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.keys.lock().iter().map(|k| k.bytes.clone()).collect()
    }

    pub fn primary_key(&self) -> Vec<u8> {
        self.keys.lock().first().map(|k| k.bytes.clone()).unwrap()
    }

    /// Seals `plaintext` into `[version | nonce | ciphertext | tag]` using
    /// the primary key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let keys = self.keys.lock();
        let sealed = keys
            .first()
            .ok_or_else(|| Error::State("Keyring is empty".to_string()))?
            .cipher
            .encrypt(&nonce, plaintext)?;

        let mut bytes = Vec::with_capacity(sealed.len() + 1 + NONCE_LEN);
        bytes.push(ENVELOPE_VERSION);
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(&sealed);
        Ok(bytes)
    }

    /// Opens an envelope, trying every installed key in order until the
    /// auth tag validates.
    pub fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() < ENCRYPT_OVERHEAD || bytes[0] != ENVELOPE_VERSION {
            return Err(Error::DecryptionFailed);
        }
        let nonce = &bytes[1..1 + NONCE_LEN];
        let ciphertext = &bytes[1 + NONCE_LEN..];

        for key in self.keys.lock().iter() {
            if let Ok(plaintext) = key.cipher.decrypt(nonce, ciphertext) {
                return Ok(plaintext);
            }
        }
        Err(Error::DecryptionFailed)
    }

    /// Reloads key material from the configured file, replacing the
    /// in-memory ring. Used by the SIGHUP handler.
    pub fn reload(&self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => return Ok(()),
        };
        let fresh = Keyring::load(&path)?;
        let mut keys = self.keys.lock();
        *keys = std::mem::take(&mut *fresh.keys.lock());
        Ok(())
    }

    fn persist(&self, keys: &[InstalledKey]) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let encoded = keys.iter().map(|k| base64::encode(&k.bytes)).collect::<Vec<_>>();
        let content = serde_json::to_string_pretty(&encoded)
            .map_err(|err| Error::Fatal(format!("Failed to serialize keyring: {}", err)))?;

        // Write a sibling temp file and rename over the original so a
        // crash cannot leave a truncated keyring behind.
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, content).map_err(|err| {
            Error::Fatal(format!(
                "Failed to write keyring file {}: {}",
                tmp_path.display(),
                err
            ))
        })?;
        std::fs::rename(&tmp_path, path).map_err(|err| {
            Error::Fatal(format!(
                "Failed to replace keyring file {}: {}",
                path.display(),
                err
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8, len: usize) -> Vec<u8> {
        vec![fill; len]
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        for len in [16, 24, 32] {
            let ring = Keyring::new(key(1, len), None).unwrap();
            let sealed = ring.encrypt(b"gossip").unwrap();
            assert_eq!(sealed[0], ENVELOPE_VERSION);
            assert_eq!(sealed.len(), b"gossip".len() + ENCRYPT_OVERHEAD);
            assert_eq!(ring.decrypt(&sealed).unwrap(), b"gossip");
        }
    }

    #[test]
    fn decrypt_tries_all_keys_in_order() {
        let writer = Keyring::new(key(1, 32), None).unwrap();
        let sealed = writer.encrypt(b"payload").unwrap();

        // Reader has the writer's key installed second.
        let reader = Keyring::new(key(2, 32), None).unwrap();
        reader.install(key(1, 32)).unwrap();
        assert_eq!(reader.decrypt(&sealed).unwrap(), b"payload");

        // A ring without the key rejects the packet.
        let stranger = Keyring::new(key(3, 32), None).unwrap();
        assert!(matches!(
            stranger.decrypt(&sealed),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn invalid_key_length() {
        assert!(matches!(
            Keyring::new(key(0, 15), None),
            Err(Error::InvalidKeyLength(15))
        ));
    }

    #[test]
    fn use_key_changes_primary() {
        let ring = Keyring::new(key(1, 32), None).unwrap();
        ring.install(key(2, 32)).unwrap();
        assert_eq!(ring.primary_key(), key(1, 32));

        ring.use_key(&key(2, 32)).unwrap();
        assert_eq!(ring.primary_key(), key(2, 32));
        assert_eq!(ring.keys().len(), 2);

        assert!(matches!(
            ring.use_key(&key(9, 32)),
            Err(Error::PrimaryKeyNotFound)
        ));
    }

    #[test]
    fn removing_primary_is_rejected() {
        let ring = Keyring::new(key(1, 32), None).unwrap();
        ring.install(key(2, 32)).unwrap();
        assert!(ring.remove(&key(1, 32)).is_err());
        ring.remove(&key(2, 32)).unwrap();
        assert_eq!(ring.keys().len(), 1);
    }

    #[test]
    fn keyring_file_round_trip() {
        let dir = std::env::temp_dir().join(format!(
            "mesh-keyring-test-{}",
            rand::random::<u64>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keyring.json");

        let ring = Keyring::new(key(1, 32), Some(path.clone())).unwrap();
        ring.install(key(2, 16)).unwrap();
        ring.use_key(&key(2, 16)).unwrap();

        let loaded = Keyring::load(&path).unwrap();
        assert_eq!(loaded.primary_key(), key(2, 16));
        assert_eq!(loaded.keys(), vec![key(2, 16), key(1, 32)]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_keyring_file_is_fatal() {
        let dir = std::env::temp_dir().join(format!(
            "mesh-keyring-corrupt-{}",
            rand::random::<u64>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keyring.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            Keyring::load(&path),
            Err(Error::Configuration(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}

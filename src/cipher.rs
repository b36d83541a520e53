//! Fixed-key Blowfish/ECB transform applied to every encrypted backup member.

use block_modes::block_padding::Pkcs7;
use block_modes::Ecb;
use block_modes::{BlockMode, BlockModeError};
use blowfish::Blowfish;

use crate::error::{Error, Result};

type BlowfishEcb = Ecb<Blowfish, Pkcs7>;

/// Blowfish operates on 8-byte blocks.
pub const BLOCK_SIZE: usize = 8;

const BACKUP_KEY: &[u8; 10] = b"JSTMUSIC_2";

fn cipher() -> Result<BlowfishEcb> {
    return BlowfishEcb::new_from_slices(BACKUP_KEY, &[]).map_err(|_| Error::InvalidKey);
}

/// Decrypts a whole member and strips its PKCS#7 padding.
///
/// Fails with [`Error::Padding`] when the input is not a whole number of
/// blocks or the padding is structurally invalid, which is what a plaintext
/// member looks like after decryption.
pub fn decrypt(ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = ciphertext.to_vec();

    let len = cipher()?
        .decrypt(buffer.as_mut_slice())
        .map_err(|_: BlockModeError| Error::Padding)?
        .len();

    buffer.truncate(len);

    return Ok(buffer);
}

/// Pads to the block size and encrypts. The output length is always a
/// non-zero multiple of [`BLOCK_SIZE`].
pub fn encrypt(plaintext: &[u8]) -> Result<Vec<u8>> {
    return Ok(cipher()?.encrypt_vec(plaintext));
}

//! XOR blinding applied on top of ciphertext.
//!
//! This is not a confidentiality layer. It only makes reversal depend on
//! knowing the pad (the one-time credential or a data key), on top of the
//! AEAD underneath.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Base64-decode `data`, XOR it with `pad` cycled to its length, and
/// base64-encode the result.
///
/// Applying it twice with the same pad returns the original input.
pub fn scramble(data: &str, pad: &[u8]) -> Result<String> {
    let mut raw = Zeroizing::new(
        BASE64
            .decode(data)
            .map_err(|e| VaultError::Format(format!("scramble input is not base64: {e}")))?,
    );
    if raw.is_empty() || pad.is_empty() {
        return Err(VaultError::Validation(
            "data and pad must not be empty".to_string(),
        ));
    }
    xor_in_place(&mut raw, pad);
    Ok(BASE64.encode(raw.as_slice()))
}

/// Scramble raw bytes, skipping the leading base64 round.
pub fn scramble_bytes(data: &[u8], pad: &[u8]) -> Result<String> {
    scramble(&BASE64.encode(data), pad)
}

/// Reverse `scramble_bytes`.
pub fn unscramble_bytes(scrambled: &str, pad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let plain = Zeroizing::new(scramble(scrambled, pad)?);
    BASE64
        .decode(plain.as_bytes())
        .map(Zeroizing::new)
        .map_err(|e| VaultError::Format(format!("unscrambled data is not base64: {e}")))
}

fn xor_in_place(data: &mut [u8], pad: &[u8]) {
    for (byte, key) in data.iter_mut().zip(pad.iter().cycle()) {
        *byte ^= key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_involution() {
        let pads: [&[u8]; 3] = [b"k", b"testOTP", &[0xFF; 200]];
        for pad in pads {
            for input in [&b"x"[..], &b"testData"[..], &[0u8; 333][..]] {
                let once = scramble(&BASE64.encode(input), pad).unwrap();
                let twice = scramble(&once, pad).unwrap();
                assert_eq!(BASE64.decode(twice).unwrap(), input);
            }
        }
    }

    #[test]
    fn test_output_differs_from_input() {
        let encoded = BASE64.encode(b"testData");
        let scrambled = scramble(&encoded, b"testOTP").unwrap();
        assert_ne!(scrambled, encoded);
        assert!(BASE64.decode(&scrambled).is_ok());
    }

    #[test]
    fn test_pad_cycles() {
        let scrambled = scramble_bytes(&[0u8; 5], &[1, 2]).unwrap();
        assert_eq!(BASE64.decode(scrambled).unwrap(), vec![1, 2, 1, 2, 1]);
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(
            scramble("", b"testOTP"),
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            scramble(&BASE64.encode(b"testData"), b""),
            Err(VaultError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_non_base64() {
        assert!(matches!(
            scramble("not base64!", b"pad"),
            Err(VaultError::Format(_))
        ));
    }

    #[test]
    fn test_bytes_helpers() {
        let scrambled = scramble_bytes(b"raw bytes", b"pad").unwrap();
        assert_eq!(
            unscramble_bytes(&scrambled, b"pad").unwrap().as_slice(),
            b"raw bytes"
        );
    }
}

//! Harp frame checksum
//!
//! The trailing byte of every frame is the 8-bit wrapping sum of all the
//! bytes that precede it.

/// Simple 8-bit sum
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Verify a complete frame whose last byte is the checksum.
///
/// Returns `(expected, actual)` on mismatch.
pub fn verify(frame: &[u8]) -> Result<(), (u8, u8)> {
    let Some((&actual, body)) = frame.split_last() else {
        return Err((0, 0));
    };
    let expected = sum8(body);
    if expected == actual {
        Ok(())
    } else {
        Err((expected, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum8_wraps() {
        assert_eq!(sum8(&[0x01, 0x02, 0x03]), 0x06);
        assert_eq!(sum8(&[0xFF, 0x02]), 0x01);
        assert_eq!(sum8(&[]), 0x00);
    }

    #[test]
    fn test_verify() {
        // Read U8 request for address 0
        let frame = [0x01, 0x04, 0x00, 0xFF, 0x01, 0x05];
        assert!(verify(&frame).is_ok());

        let corrupt = [0x01, 0x04, 0x00, 0xFF, 0x01, 0x06];
        assert_eq!(verify(&corrupt), Err((0x05, 0x06)));
    }
}

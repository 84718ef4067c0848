use crate::errors::RelayError;

const PADDING_BLOCK: usize = 160;
const TERMINATOR: u8 = 0x80;

pub fn pad_message_buffer(message: &[u8]) -> Vec<u8> {
    let padded_len = ((message.len() + 1 + PADDING_BLOCK - 1) / PADDING_BLOCK) * PADDING_BLOCK;
    let mut out = vec![0u8; padded_len];
    out[..message.len()].copy_from_slice(message);
    out[message.len()] = TERMINATOR;
    out
}

pub fn unpad_message_buffer(padded: &[u8]) -> Result<Vec<u8>, RelayError> {
    for i in (0..padded.len()).rev() {
        match padded[i] {
            TERMINATOR => return Ok(padded[..i].to_vec()),
            0x00 => continue,
            _ => return Err(RelayError::Codec("invalid message padding")),
        }
    }
    Err(RelayError::Codec("missing padding terminator"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_block_multiple() {
        let padded = pad_message_buffer(b"hi");
        assert_eq!(padded.len(), 160);
        assert_eq!(padded[2], 0x80);
        assert!(padded[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn roundtrips_various_lengths() {
        for len in [0usize, 1, 2, 159, 160, 161, 319, 320, 1000] {
            let message: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
            let padded = pad_message_buffer(&message);
            assert_eq!(padded.len() % 160, 0);
            assert!(padded.len() > message.len());
            assert_eq!(unpad_message_buffer(&padded).expect("unpad"), message);
        }
    }

    #[test]
    fn rejects_padding_violation() {
        let mut padded = pad_message_buffer(b"hello");
        let last = padded.len() - 1;
        padded[last] = 0x01;
        assert!(unpad_message_buffer(&padded).is_err());
    }

    #[test]
    fn rejects_missing_terminator() {
        assert!(unpad_message_buffer(&[0u8; 160]).is_err());
    }
}

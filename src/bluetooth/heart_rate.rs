/// Heart Rate Profile constants and Heart Rate Measurement decoding
use bluer::Uuid;

// Standard Heart Rate Profile identifiers on the Bluetooth base UUID
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

const FLAG_VALUE_FORMAT_U16: u8 = 0x01;

/// Decode a Heart Rate Measurement characteristic value into beats per minute
///
/// The payload layout is:
/// - Byte 0: Flags. Bit 0 selects the value format (0 = u8, 1 = u16 little-endian)
/// - Byte 1 (u8 format): Heart rate
/// - Bytes 1-2 (u16 format): Heart rate, little-endian
///
/// The remaining flag bits (sensor contact, energy expended, RR intervals) are ignored.
///
/// # Returns
/// The heart rate in bpm. An empty or truncated payload yields 0, the wire
/// convention for "no reading yet".
pub fn decode_heart_rate(data: &[u8]) -> u16 {
    let Some(&flags) = data.first() else {
        return 0;
    };

    if flags & FLAG_VALUE_FORMAT_U16 == 0 {
        data.get(1).map(|&bpm| bpm as u16).unwrap_or(0)
    } else {
        match (data.get(1), data.get(2)) {
            (Some(&lo), Some(&hi)) => u16::from_le_bytes([lo, hi]),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u8_format_reads_single_byte() {
        assert_eq!(decode_heart_rate(&[0x00, 72]), 72);
    }

    #[test]
    fn u8_format_is_unsigned() {
        assert_eq!(decode_heart_rate(&[0x00, 200]), 200);
        assert_eq!(decode_heart_rate(&[0x00, 0xFF]), 255);
    }

    #[test]
    fn u16_format_is_little_endian() {
        assert_eq!(decode_heart_rate(&[0x01, 0x2C, 0x01]), 300);
    }

    #[test]
    fn other_flag_bits_do_not_change_width() {
        // sensor contact bits set, still u8
        assert_eq!(decode_heart_rate(&[0x06, 61, 0x99]), 61);
        // energy expended + u16
        assert_eq!(decode_heart_rate(&[0x09, 0x50, 0x00, 0x10, 0x00]), 80);
    }

    #[test]
    fn empty_payload_is_zero() {
        assert_eq!(decode_heart_rate(&[]), 0);
    }

    #[test]
    fn truncated_payload_is_zero() {
        assert_eq!(decode_heart_rate(&[0x00]), 0);
        assert_eq!(decode_heart_rate(&[0x01, 0x2C]), 0);
    }

    #[test]
    fn profile_uuids_match_assigned_numbers() {
        assert_eq!(
            HEART_RATE_SERVICE_UUID.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            HEART_RATE_MEASUREMENT_UUID.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIG_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }
}
